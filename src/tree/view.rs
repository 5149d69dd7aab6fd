use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future;
use futures::stream::{BoxStream, StreamExt};

use super::Source;
use crate::core::{TypeTag, Unknown};
use crate::data::Data;
use crate::error::TreeError;
use crate::meta::Meta;
use crate::name::Name;
use crate::placement::Placement;

type Predicate = dyn Fn(&Name, &Data<Unknown>) -> bool + Send + Sync;

/// Entries of the parent for which a predicate holds.
pub(crate) struct FilterSource {
    parent: Arc<dyn Source>,
    predicate: Arc<Predicate>,
}

impl FilterSource {
    pub(crate) fn new<F>(parent: Arc<dyn Source>, predicate: F) -> Self
    where
        F: Fn(&Name, &Data<Unknown>) -> bool + Send + Sync + 'static,
    {
        Self {
            parent,
            predicate: Arc::new(predicate),
        }
    }
}

impl Source for FilterSource {
    fn meta(&self) -> Meta {
        self.parent.meta()
    }

    fn get(&self, name: &Name) -> Option<Data<Unknown>> {
        self.parent
            .get(name)
            .filter(|data| (self.predicate)(name, data))
    }

    fn items(&self) -> Vec<(Name, Data<Unknown>)> {
        self.parent
            .items()
            .into_iter()
            .filter(|(name, data)| (self.predicate)(name, data))
            .collect()
    }

    fn updates(&self) -> BoxStream<'static, Name> {
        let parent = self.parent.clone();
        let predicate = self.predicate.clone();

        self.parent
            .updates()
            .filter(move |name| {
                // removed entries are always reported
                let keep = match parent.get(name) {
                    Some(data) => predicate(name, &data),
                    None => true,
                };
                future::ready(keep)
            })
            .boxed()
    }

    fn is_observable(&self) -> bool {
        self.parent.is_observable()
    }
}

/// Entries of the parent renamed by a placement.
pub(crate) struct RearrangeSource {
    parent: Arc<dyn Source>,
    placement: Arc<dyn Placement>,
}

impl RearrangeSource {
    pub(crate) fn new(parent: Arc<dyn Source>, placement: Arc<dyn Placement>) -> Self {
        Self { parent, placement }
    }

    fn place(&self, name: &Name, data: &Data<Unknown>) -> Option<Name> {
        self.placement.place(name, data.meta(), &data.type_tag())
    }

    pub(crate) fn check_conflicts(&self) -> Result<(), TreeError> {
        let mut seen = BTreeSet::new();
        for (name, data) in self.parent.items() {
            if let Some(placed) = self.place(&name, &data) {
                if !seen.insert(placed.clone()) {
                    return Err(TreeError::NameConflict(placed));
                }
            }
        }
        Ok(())
    }
}

impl Source for RearrangeSource {
    fn meta(&self) -> Meta {
        self.parent.meta()
    }

    fn get(&self, name: &Name) -> Option<Data<Unknown>> {
        self.parent
            .items()
            .into_iter()
            .find(|(original, data)| self.place(original, data).as_ref() == Some(name))
            .map(|(_, data)| data)
    }

    fn items(&self) -> Vec<(Name, Data<Unknown>)> {
        let mut items = BTreeMap::new();
        for (name, data) in self.parent.items() {
            if let Some(placed) = self.place(&name, &data) {
                items.entry(placed).or_insert(data);
            }
        }
        items.into_iter().collect()
    }

    fn updates(&self) -> BoxStream<'static, Name> {
        let parent = self.parent.clone();
        let placement = self.placement.clone();

        self.parent
            .updates()
            .filter_map(move |name| {
                let placed = match parent.get(&name) {
                    Some(data) => placement.place(&name, data.meta(), &data.type_tag()),
                    None => placement.place(&name, &Meta::empty(), &TypeTag::of::<Unknown>()),
                };
                future::ready(placed)
            })
            .boxed()
    }

    fn is_observable(&self) -> bool {
        self.parent.is_observable()
    }
}
