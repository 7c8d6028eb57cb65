//! VDI metadata engine boundary.
//!
//! VDI (virtual disk image) metadata operations are arbitrated by the
//! cluster master: the originating node broadcasts the operation through the
//! group, the master executes it against its local VDI engine in stage-1,
//! and the result is rebroadcast so every node applies the same side effects
//! in the same order. This module defines the engine seam, the shared in-use
//! bitmap, and an in-memory engine good enough to exercise every operation.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use shoal_core::ResultCode;

/// Total number of addressable VDI ids.
pub const NR_VDIS: usize = 1 << 24;

// ---------------------------------------------------------------------------
// VdiBitmap
// ---------------------------------------------------------------------------

/// Bit set of in-use VDI ids, OR-merged across peers during join
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VdiBitmap {
    words: Vec<u64>,
}

impl Default for VdiBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl VdiBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            words: vec![0; NR_VDIS / 64],
        }
    }

    pub fn set(&mut self, vdi_id: u32) {
        let idx = vdi_id as usize % NR_VDIS;
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    #[must_use]
    pub fn test(&self, vdi_id: u32) -> bool {
        let idx = vdi_id as usize % NR_VDIS;
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// OR-merges a peer's bitmap into this one.
    pub fn or_merge(&mut self, other: &VdiBitmap) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }
}

// ---------------------------------------------------------------------------
// VdiEngine trait
// ---------------------------------------------------------------------------

/// Outcome of a VDI engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdiOpResult {
    pub result: ResultCode,
    pub vdi_id: u32,
    pub attr_id: u32,
}

impl VdiOpResult {
    #[must_use]
    pub fn fail(result: ResultCode) -> Self {
        Self {
            result,
            vdi_id: 0,
            attr_id: 0,
        }
    }

    #[must_use]
    pub fn ok(vdi_id: u32) -> Self {
        Self {
            result: ResultCode::Success,
            vdi_id,
            attr_id: 0,
        }
    }
}

/// The VDI metadata operations executed by the master on behalf of the
/// cluster. Implementations own name→id allocation and attribute storage;
/// replication of the metadata objects themselves is the object store's
/// concern.
pub trait VdiEngine: Send + Sync {
    fn new_vdi(&self, name: &[u8], vdi_size: u64, base_vdi_id: u32, snapid: u32) -> VdiOpResult;
    fn del_vdi(&self, name: &[u8], snapid: u32) -> VdiOpResult;
    fn lookup_vdi(&self, name: &[u8], snapid: u32) -> VdiOpResult;
    /// Looks up or creates an attribute of a VDI. `create`/`exclusive`
    /// mirror the `CMD_CREAT`/`CMD_EXCL` request flags.
    fn vdi_attr(&self, name: &[u8], attr: &[u8], create: bool, exclusive: bool) -> VdiOpResult;
}

// ---------------------------------------------------------------------------
// InMemoryVdiEngine
// ---------------------------------------------------------------------------

/// In-memory VDI engine: FNV-style id allocation with linear probing over
/// the id space, attribute ids hashed from the attribute key.
#[derive(Default)]
pub struct InMemoryVdiEngine {
    names: DashMap<Vec<u8>, u32>,
    attrs: DashSet<(u32, u64)>,
}

impl InMemoryVdiEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, name: &[u8]) -> u32 {
        // Hash the name into the id space; bump past collisions.
        let mut vid = (fnv64(name) as u32) & (NR_VDIS as u32 - 1);
        if vid == 0 {
            vid = 1;
        }
        while self.names.iter().any(|kv| *kv.value() == vid) {
            vid = vid.wrapping_add(1) & (NR_VDIS as u32 - 1);
            if vid == 0 {
                vid = 1;
            }
        }
        vid
    }
}

impl VdiEngine for InMemoryVdiEngine {
    fn new_vdi(&self, name: &[u8], vdi_size: u64, _base_vdi_id: u32, _snapid: u32) -> VdiOpResult {
        if name.is_empty() {
            return VdiOpResult::fail(ResultCode::InvalidParms);
        }
        if self.names.contains_key(name) {
            return VdiOpResult::fail(ResultCode::InvalidParms);
        }
        let vid = self.allocate(name);
        self.names.insert(name.to_vec(), vid);
        debug!(vid, vdi_size, "created vdi");
        VdiOpResult::ok(vid)
    }

    fn del_vdi(&self, name: &[u8], _snapid: u32) -> VdiOpResult {
        match self.names.remove(name) {
            Some((_, vid)) => VdiOpResult::ok(vid),
            None => VdiOpResult::fail(ResultCode::NoTag),
        }
    }

    fn lookup_vdi(&self, name: &[u8], _snapid: u32) -> VdiOpResult {
        match self.names.get(name) {
            Some(vid) => VdiOpResult::ok(*vid),
            None => VdiOpResult::fail(ResultCode::NoTag),
        }
    }

    fn vdi_attr(&self, name: &[u8], attr: &[u8], create: bool, exclusive: bool) -> VdiOpResult {
        let looked = self.lookup_vdi(name, 0);
        if !looked.result.is_success() {
            return looked;
        }
        let attr_id = fnv64(attr);
        let key = (looked.vdi_id, attr_id);
        let exists = self.attrs.contains(&key);
        if exists && create && exclusive {
            return VdiOpResult::fail(ResultCode::InvalidParms);
        }
        if !exists {
            if !create {
                return VdiOpResult::fail(ResultCode::NoTag);
            }
            self.attrs.insert(key);
        }
        VdiOpResult {
            result: ResultCode::Success,
            vdi_id: looked.vdi_id,
            attr_id: (attr_id as u32) & (NR_VDIS as u32 - 1),
        }
    }
}

/// FNV-1a, also used for attribute and placement hashing.
#[must_use]
pub fn fnv64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_set_test_merge() {
        let mut a = VdiBitmap::new();
        let mut b = VdiBitmap::new();
        a.set(7);
        b.set(1000);
        assert!(a.test(7));
        assert!(!a.test(1000));

        a.or_merge(&b);
        assert!(a.test(7));
        assert!(a.test(1000));

        a.clear();
        assert!(!a.test(7));
    }

    #[test]
    fn new_vdi_allocates_and_rejects_duplicates() {
        let eng = InMemoryVdiEngine::new();
        let r = eng.new_vdi(b"vol0", 4 << 30, 0, 0);
        assert!(r.result.is_success());
        assert_ne!(r.vdi_id, 0);

        let dup = eng.new_vdi(b"vol0", 4 << 30, 0, 0);
        assert_eq!(dup.result, ResultCode::InvalidParms);
    }

    #[test]
    fn lookup_and_delete() {
        let eng = InMemoryVdiEngine::new();
        let created = eng.new_vdi(b"vol0", 1, 0, 0);
        assert_eq!(eng.lookup_vdi(b"vol0", 0).vdi_id, created.vdi_id);
        assert_eq!(eng.lookup_vdi(b"missing", 0).result, ResultCode::NoTag);

        assert!(eng.del_vdi(b"vol0", 0).result.is_success());
        assert_eq!(eng.lookup_vdi(b"vol0", 0).result, ResultCode::NoTag);
    }

    #[test]
    fn attr_create_and_excl_semantics() {
        let eng = InMemoryVdiEngine::new();
        eng.new_vdi(b"vol0", 1, 0, 0);

        // Missing attr without create fails.
        assert_eq!(
            eng.vdi_attr(b"vol0", b"tag", false, false).result,
            ResultCode::NoTag
        );
        // Create succeeds, exclusive re-create fails, plain read succeeds.
        assert!(eng.vdi_attr(b"vol0", b"tag", true, false).result.is_success());
        assert_eq!(
            eng.vdi_attr(b"vol0", b"tag", true, true).result,
            ResultCode::InvalidParms
        );
        assert!(eng.vdi_attr(b"vol0", b"tag", false, false).result.is_success());
    }

    #[test]
    fn attr_on_missing_vdi_fails() {
        let eng = InMemoryVdiEngine::new();
        assert_eq!(
            eng.vdi_attr(b"ghost", b"tag", true, false).result,
            ResultCode::NoTag
        );
    }
}
