//! Self-describing container of a meta and an optional binary payload.
//!
//! Envelopes are the persistence format of [`FileCache`](crate::cache::FileCache)
//! and the wire format of the remote extension. Two encodings exist:
//!
//! * tagged, a fixed 24 byte binary header followed by the meta and the data,
//! * tagless, text markers with `#? key: value;` property lines.
//!
//! [`deserialize`] recognizes both, [`serialize`] always writes the tagged one.

use std::io::Write;

use crate::error::EnvelopeError;
use crate::meta::Meta;

const TAGGED_START: &[u8; 2] = b"#~";
const TAGGED_VERSION: &[u8; 4] = b"DF03";
const TAGGED_END: &[u8; 4] = b"~#\r\n";
const TAGGED_HEADER: usize = 24;
const META_JSON: &[u8; 2] = b"JS";

const TAGLESS_START: &[u8] = b"#~DFTL~#";
const TAGLESS_META: &[u8] = b"#~META~#";
const TAGLESS_DATA: &[u8] = b"#~DATA~#";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub meta: Meta,
    /// Raw payload, an empty payload is read back as `None`.
    pub data: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new(meta: Meta, data: impl Into<Option<Vec<u8>>>) -> Self {
        Self {
            meta,
            data: data.into(),
        }
    }

    pub fn meta_only(meta: Meta) -> Self {
        Self { meta, data: None }
    }

    /// Only a null meta is written as zero bytes, an empty object keeps its
    /// form so it reads back equal.
    fn meta_bytes(&self) -> Vec<u8> {
        if self.meta.value().is_null() {
            Vec::new()
        } else {
            self.meta.to_bytes()
        }
    }

    fn data_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

/// A concrete envelope encoding.
pub trait EnvelopeFormat {
    /// Whether `bytes` start with an envelope of this format.
    fn detect(&self, bytes: &[u8]) -> bool;

    fn write(&self, envelope: &Envelope, writer: &mut dyn Write) -> Result<(), EnvelopeError>;

    /// Read one envelope from the start of `bytes`, returning it together with
    /// the number of bytes consumed.
    fn read(&self, bytes: &[u8]) -> Result<(Envelope, usize), EnvelopeError>;
}

/// Binary form: `#~DF03`, meta format key, u32 meta length, u64 data length,
/// `~#\r\n`, then the meta and the data. Integers are big-endian.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaggedFormat;

impl EnvelopeFormat for TaggedFormat {
    fn detect(&self, bytes: &[u8]) -> bool {
        bytes.len() >= 6 && bytes[..2] == *TAGGED_START && bytes[2..6] == *TAGGED_VERSION
    }

    fn write(&self, envelope: &Envelope, writer: &mut dyn Write) -> Result<(), EnvelopeError> {
        let meta = envelope.meta_bytes();
        let data = envelope.data_bytes();
        let meta_len = u32::try_from(meta.len())
            .map_err(|_| EnvelopeError::Header(format!("meta of {} bytes is too large", meta.len())))?;

        writer.write_all(TAGGED_START)?;
        writer.write_all(TAGGED_VERSION)?;
        writer.write_all(META_JSON)?;
        writer.write_all(&meta_len.to_be_bytes())?;
        writer.write_all(&(data.len() as u64).to_be_bytes())?;
        writer.write_all(TAGGED_END)?;
        writer.write_all(&meta)?;
        writer.write_all(data)?;
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<(Envelope, usize), EnvelopeError> {
        if bytes.len() < TAGGED_HEADER {
            return Err(EnvelopeError::Truncated {
                expected: TAGGED_HEADER,
                found: bytes.len(),
            });
        }

        let (header, rest) = bytes.split_at(TAGGED_HEADER);
        if !self.detect(header) || header[20..24] != *TAGGED_END {
            return Err(EnvelopeError::Header(String::from_utf8_lossy(header).into_owned()));
        }
        if header[6..8] != *META_JSON {
            return Err(EnvelopeError::MetaFormat(
                String::from_utf8_lossy(&header[6..8]).into_owned(),
            ));
        }

        let meta_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let mut data_len = [0; 8];
        data_len.copy_from_slice(&header[12..20]);
        let data_len = usize::try_from(u64::from_be_bytes(data_len))
            .map_err(|_| EnvelopeError::Header("data length overflows".into()))?;

        let total = meta_len
            .checked_add(data_len)
            .ok_or_else(|| EnvelopeError::Header("data length overflows".into()))?;
        if rest.len() < total {
            return Err(EnvelopeError::Truncated {
                expected: TAGGED_HEADER + total,
                found: bytes.len(),
            });
        }

        let meta = Meta::from_bytes(&rest[..meta_len])?;
        let data = rest[meta_len..total].to_vec();
        let envelope = Envelope::new(meta, (!data.is_empty()).then_some(data));

        Ok((envelope, TAGGED_HEADER + total))
    }
}

/// Text delimited form.
///
/// ```text
/// #~DFTL~#
/// #? metaType: JS;
/// #? metaLength: 13;
/// #? dataLength: 5;
/// #~META~#
/// {"unit":"nm"}
/// #~DATA~#
/// hello
/// ```
///
/// Length properties are optional when reading: without them the meta runs to
/// the data marker and the data runs to the end of the input.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaglessFormat;

impl EnvelopeFormat for TaglessFormat {
    fn detect(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(TAGLESS_START)
    }

    fn write(&self, envelope: &Envelope, writer: &mut dyn Write) -> Result<(), EnvelopeError> {
        let meta = envelope.meta_bytes();
        let data = envelope.data_bytes();

        writer.write_all(TAGLESS_START)?;
        writer.write_all(b"\n")?;
        writeln!(writer, "#? metaType: JS;")?;
        writeln!(writer, "#? metaLength: {};", meta.len())?;
        writeln!(writer, "#? dataLength: {};", data.len())?;
        writer.write_all(TAGLESS_META)?;
        writer.write_all(b"\n")?;
        writer.write_all(&meta)?;
        writer.write_all(b"\n")?;
        writer.write_all(TAGLESS_DATA)?;
        writer.write_all(b"\n")?;
        writer.write_all(data)?;
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<(Envelope, usize), EnvelopeError> {
        if !self.detect(bytes) {
            return Err(EnvelopeError::Header("missing #~DFTL~# marker".into()));
        }

        let mut cursor = Cursor::new(bytes, TAGLESS_START.len());
        cursor.skip_newline();

        let mut meta_len = None;
        let mut data_len = None;

        loop {
            let line = cursor.line();
            if line == TAGLESS_META {
                break;
            }
            if line == TAGLESS_DATA || cursor.at_end() {
                return Err(EnvelopeError::Header("missing #~META~# marker".into()));
            }

            let (key, value) = parse_property(line)?;
            match key {
                "metaType" if value != "JS" => return Err(EnvelopeError::MetaFormat(value.into())),
                "metaLength" => meta_len = Some(parse_length(value)?),
                "dataLength" => data_len = Some(parse_length(value)?),
                _ => {}
            }
        }

        let meta = match meta_len {
            Some(len) => {
                let meta = cursor.take(len)?;
                cursor.skip_newline();
                let marker = cursor.line();
                if marker != TAGLESS_DATA {
                    return Err(EnvelopeError::Header("missing #~DATA~# marker".into()));
                }
                meta
            }
            None => cursor.until(TAGLESS_DATA)?,
        };

        let data = match data_len {
            Some(len) => cursor.take(len)?,
            None => cursor.rest(),
        };

        let meta = Meta::from_bytes(trim_newline(meta))?;
        let envelope = Envelope::new(meta, (!data.is_empty()).then(|| data.to_vec()));
        Ok((envelope, cursor.position))
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], position: usize) -> Self {
        Self { bytes, position }
    }

    fn at_end(&self) -> bool {
        self.position >= self.bytes.len()
    }

    fn skip_newline(&mut self) {
        let rest = &self.bytes[self.position..];
        if rest.starts_with(b"\r\n") {
            self.position += 2;
        } else if rest.starts_with(b"\n") {
            self.position += 1;
        }
    }

    /// The next line without its line break.
    fn line(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.position..];
        let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        self.position += (end + 1).min(rest.len());
        trim_newline(&rest[..end])
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EnvelopeError> {
        let rest = &self.bytes[self.position..];
        if rest.len() < len {
            return Err(EnvelopeError::Truncated {
                expected: self.position + len,
                found: self.bytes.len(),
            });
        }
        self.position += len;
        Ok(&rest[..len])
    }

    /// Everything up to the line holding `marker`, the marker line is consumed.
    fn until(&mut self, marker: &[u8]) -> Result<&'a [u8], EnvelopeError> {
        let rest = &self.bytes[self.position..];
        let found = rest
            .windows(marker.len())
            .position(|window| window == marker)
            .ok_or_else(|| EnvelopeError::Header("missing #~DATA~# marker".into()))?;

        self.position += found + marker.len();
        self.skip_newline();
        Ok(&rest[..found])
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.position..];
        self.position = self.bytes.len();
        rest
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn parse_property(line: &[u8]) -> Result<(&str, &str), EnvelopeError> {
    let malformed = || EnvelopeError::Header(format!("malformed property line '{}'", String::from_utf8_lossy(line)));

    let line = std::str::from_utf8(line).map_err(|_| malformed())?;
    let body = line
        .strip_prefix("#?")
        .and_then(|body| body.trim().strip_suffix(';'))
        .ok_or_else(malformed)?;
    let (key, value) = body.split_once(':').ok_or_else(malformed)?;

    Ok((key.trim(), value.trim()))
}

fn parse_length(value: &str) -> Result<usize, EnvelopeError> {
    value
        .parse()
        .map_err(|_| EnvelopeError::Header(format!("invalid length '{value}'")))
}

/// Encode an envelope in the tagged form.
pub fn serialize(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    let mut buffer = Vec::with_capacity(TAGGED_HEADER + envelope.data_bytes().len());
    TaggedFormat.write(envelope, &mut buffer)?;
    Ok(buffer)
}

/// Decode a single envelope of either form.
pub fn deserialize(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    read_next(bytes).map(|(envelope, _)| envelope)
}

/// Decode the envelope at the start of `bytes` and report how many bytes it
/// took, used to read a sequence of envelopes.
pub fn read_next(bytes: &[u8]) -> Result<(Envelope, usize), EnvelopeError> {
    if TaggedFormat.detect(bytes) {
        TaggedFormat.read(bytes)
    } else if TaglessFormat.detect(bytes) {
        TaglessFormat.read(bytes)
    } else {
        let start = &bytes[..bytes.len().min(8)];
        Err(EnvelopeError::Header(format!(
            "unknown envelope start '{}'",
            String::from_utf8_lossy(start)
        )))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Envelope {
        Envelope::new(Meta::new(json!({ "unit": "nm", "scale": 2 })), b"hello".to_vec())
    }

    #[test]
    fn test_tagged_header_layout() {
        let bytes = serialize(&sample()).unwrap();
        let meta = sample().meta.to_bytes();

        assert_eq!(&bytes[..8], b"#~DF03JS");
        assert_eq!(&bytes[8..12], &(meta.len() as u32).to_be_bytes());
        assert_eq!(&bytes[12..20], &5u64.to_be_bytes());
        assert_eq!(&bytes[20..24], b"~#\r\n");
        assert_eq!(&bytes[bytes.len() - 5..], b"hello");
        assert_eq!(deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_empty_payload_reads_as_none() {
        let envelope = Envelope::new(Meta::empty(), Vec::new());
        let bytes = serialize(&envelope).unwrap();
        assert_eq!(bytes.len(), TAGGED_HEADER);
        assert_eq!(deserialize(&bytes).unwrap().data, None);
    }

    #[test]
    fn test_empty_object_meta_reads_back_equal() {
        let envelope = Envelope::new(Meta::new(json!({})), b"x".to_vec());
        let read = deserialize(&serialize(&envelope).unwrap()).unwrap();
        assert_eq!(read.meta.to_bytes(), envelope.meta.to_bytes());
    }

    #[test]
    fn test_tagless_written_and_read() {
        let mut bytes = Vec::new();
        TaglessFormat.write(&sample(), &mut bytes).unwrap();
        assert!(bytes.starts_with(b"#~DFTL~#\n#? metaType: JS;\n"));
        assert_eq!(deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_tagless_without_lengths() {
        let text = b"#~DFTL~#\r\n#~META~#\r\n{\"a\":1}\r\n#~DATA~#\r\npayload";
        let envelope = deserialize(text).unwrap();
        assert_eq!(envelope.meta.get_i64("a"), Some(1));
        assert_eq!(envelope.data.as_deref(), Some(&b"payload"[..]));
    }

    #[test]
    fn test_sequence_of_envelopes() {
        let mut bytes = serialize(&sample()).unwrap();
        bytes.extend(serialize(&Envelope::meta_only(Meta::empty().with("n", 2))).unwrap());

        let (first, used) = read_next(&bytes).unwrap();
        let (second, rest) = read_next(&bytes[used..]).unwrap();
        assert_eq!(first, sample());
        assert_eq!(second.meta.get_i64("n"), Some(2));
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn test_malformed_input() {
        let bytes = serialize(&sample()).unwrap();
        assert!(matches!(
            deserialize(&bytes[..bytes.len() - 1]),
            Err(EnvelopeError::Truncated { .. })
        ));
        assert!(matches!(deserialize(b"#~DF"), Err(EnvelopeError::Header(_))));

        let mut foreign = bytes.clone();
        foreign[6..8].copy_from_slice(b"XM");
        assert!(matches!(deserialize(&foreign), Err(EnvelopeError::MetaFormat(_))));

        assert!(matches!(
            deserialize(b"#~DFTL~#\n#? metaType: XML;\n#~META~#\n"),
            Err(EnvelopeError::MetaFormat(_))
        ));
    }
}
