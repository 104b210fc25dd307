//! Path-predicate blob store router: routes each path to the first store
//! whose predicate matches it.

use crate::error::{Error, Result};

use super::{BlobHandle, BlobStore, OpenFlags};

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct BlobStoreMux {
    routes: Vec<(Predicate, Box<dyn BlobStore>)>,
}

impl BlobStoreMux {
    #[must_use]
    pub fn new() -> Self {
        BlobStoreMux { routes: Vec::new() }
    }

    /// Add a route. Routes are tried in registration order; the first whose
    /// predicate returns `true` handles the path.
    pub fn add_route(
        &mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
        store: Box<dyn BlobStore>,
    ) {
        self.routes.push((Box::new(predicate), store));
    }

    fn route(&self, path: &str) -> Result<&dyn BlobStore> {
        self.routes
            .iter()
            .find(|(pred, _)| pred(path))
            .map(|(_, store)| store.as_ref())
            .ok_or_else(|| Error::NotFound {
                what: format!("no route for blob path {path}"),
            })
    }
}

impl Default for BlobStoreMux {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for BlobStoreMux {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn BlobHandle>> {
        self.route(path)?.open(path, flags)
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.route(path)?.remove(path)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for (_, store) in &self.routes {
            out.extend(store.list()?);
        }
        Ok(out)
    }
}
