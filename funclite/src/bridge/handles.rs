//! Per-context handle table.
//!
//! Host-owned stateful resources never cross into a guest; the guest holds
//! integer ids instead. Ids are unique within a context and never reused
//! after disposal; `clear` is the bulk teardown used by context cleanup.

use std::collections::HashMap;

use funclite_shared::{FuncliteError, FuncliteResult};

use super::crypto::{CipherState, HasherState, MacState, StreamSigner, StreamVerifier};
use super::dns::ResolverHandle;
use super::net::SocketHandle;
use super::url::SearchParams;
use super::zlib::CompressStream;

/// Host-side object behind one handle id.
pub enum HandleObject {
    Hasher(HasherState),
    Mac(MacState),
    Cipher(CipherState),
    Signer(StreamSigner),
    Verifier(StreamVerifier),
    Compress(CompressStream),
    Socket(SocketHandle),
    SearchParams(SearchParams),
    Resolver(ResolverHandle),
}

impl HandleObject {
    fn type_name(&self) -> &'static str {
        match self {
            HandleObject::Hasher(_) => "hash",
            HandleObject::Mac(_) => "hmac",
            HandleObject::Cipher(_) => "cipher",
            HandleObject::Signer(_) => "sign",
            HandleObject::Verifier(_) => "verify",
            HandleObject::Compress(_) => "compression stream",
            HandleObject::Socket(_) => "socket",
            HandleObject::SearchParams(_) => "search params",
            HandleObject::Resolver(_) => "resolver",
        }
    }
}

/// Integer-id table owned by one execution context.
#[derive(Default)]
pub struct HandleTable {
    next_id: u32,
    entries: HashMap<u32, HandleObject>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self { next_id: 1, entries: HashMap::new() }
    }

    pub fn insert(&mut self, object: HandleObject) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, object);
        id
    }

    pub fn get_mut(&mut self, id: u32) -> FuncliteResult<&mut HandleObject> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| bad_handle(id))
    }

    /// Remove for disposal or consuming operations (`digest`, `final`).
    pub fn remove(&mut self, id: u32) -> FuncliteResult<HandleObject> {
        self.entries.remove(&id).ok_or_else(|| bad_handle(id))
    }

    pub fn try_remove(&mut self, id: u32) -> Option<HandleObject> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every live entry. Sockets and files close on drop; returns how
    /// many entries were still alive (leaked by the guest).
    pub fn clear(&mut self) -> usize {
        let leaked = self.entries.len();
        self.entries.clear();
        leaked
    }

    /// Human-readable description used in leak logging.
    pub fn describe(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|o| o.type_name().to_string())
            .collect()
    }
}

fn bad_handle(id: u32) -> FuncliteError {
    FuncliteError::InvalidArgument(format!("unknown or disposed handle: {}", id))
}
