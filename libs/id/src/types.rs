//! Typed ID definitions for platform resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// MicroVMs and Snapshots
// =============================================================================

define_id!(VmId, "vm");
define_id!(SnapshotId, "snap");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_roundtrip() {
        let id = VmId::new();
        let s = id.to_string();
        let parsed: VmId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_vm_id_prefix() {
        let id = VmId::new();
        let s = id.to_string();
        assert!(s.starts_with("vm_"));
    }

    #[test]
    fn test_vm_id_invalid_prefix() {
        let result: Result<VmId, _> = "snap_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_vm_id_missing_separator() {
        let result: Result<VmId, _> = "vm01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_vm_id_empty() {
        let result: Result<VmId, _> = "".parse();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_vm_id_invalid_ulid() {
        let result: Result<VmId, _> = "vm_invalid".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_vm_id_json_roundtrip() {
        let id = VmId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: VmId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_vm_id_sortable() {
        let id1 = VmId::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = VmId::new();
        // ULIDs are time-ordered, so id1 < id2
        assert!(id1 < id2);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = vec![VmId::PREFIX, SnapshotId::PREFIX, RequestId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }
}
