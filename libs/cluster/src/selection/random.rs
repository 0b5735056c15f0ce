//! Uniform random selection

use super::{PolicyKind, Result, SelectionError, SelectionPolicy};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;

struct Lists<T> {
    local: Vec<T>,
    remote: Vec<T>,
}

pub struct RandomPolicy<T> {
    service_type: String,
    prefer_local: bool,
    lists: RwLock<Lists<T>>,
}

impl<T> RandomPolicy<T> {
    pub fn new(service_type: impl Into<String>, prefer_local: bool) -> Self {
        Self {
            service_type: service_type.into(),
            prefer_local,
            lists: RwLock::new(Lists {
                local: Vec::new(),
                remote: Vec::new(),
            }),
        }
    }
}

impl<T> SelectionPolicy<T> for RandomPolicy<T>
where
    T: Clone + Send + Sync,
{
    fn next_instance(&self) -> Result<T> {
        let lists = self.lists.read();
        let mut rng = rand::thread_rng();

        if self.prefer_local {
            if let Some(choice) = lists.local.choose(&mut rng) {
                return Ok(choice.clone());
            }
        }

        let total = lists.local.len() + lists.remote.len();
        if total == 0 {
            return Err(SelectionError::service_not_found(&self.service_type));
        }
        let index = rng.gen_range(0..total);
        Ok(match lists.local.get(index) {
            Some(local) => local.clone(),
            None => lists.remote[index - lists.local.len()].clone(),
        })
    }

    /// The combined list, shuffled. Local preference only affects
    /// `next_instance`.
    fn instances(&self) -> Result<Vec<T>> {
        let lists = self.lists.read();
        if lists.local.is_empty() && lists.remote.is_empty() {
            return Err(SelectionError::service_not_found(&self.service_type));
        }

        let mut all: Vec<T> = lists.local.iter().chain(lists.remote.iter()).cloned().collect();
        all.shuffle(&mut rand::thread_rng());
        Ok(all)
    }

    fn update_services(&self, local: Vec<T>, remote: Vec<T>) {
        *self.lists.write() = Lists { local, remote };
    }

    fn kind(&self) -> PolicyKind {
        if self.prefer_local {
            PolicyKind::RandomLocal
        } else {
            PolicyKind::Random
        }
    }
}
