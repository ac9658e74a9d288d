//! ID definitions for cluster resources.

use crate::define_id;

define_id!(NodeId, "node");
define_id!(PodId, "pod");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_node_id_prefix() {
        let id = NodeId::new();
        assert!(id.to_string().starts_with("node_"));
    }

    #[test]
    fn test_pod_id_rejects_node_prefix() {
        let node = NodeId::new().to_string();
        let err = node.parse::<PodId>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<NodeId, _> = "node01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_empty() {
        let result: Result<PodId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<NodeId, _> = "node_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = NodeId::from_parts(1, 7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_from_parts_orders_by_timestamp() {
        let first = NodeId::from_parts(1, u128::MAX >> 48);
        let second = NodeId::from_parts(2, 0);
        assert!(first < second);
    }

    #[test]
    fn test_prefixes_unique() {
        assert_ne!(NodeId::PREFIX, PodId::PREFIX);
    }

    proptest! {
        #[test]
        fn parse_accepts_display_output(ts in 0u64..(1u64 << 48), rand in any::<u64>()) {
            let id = PodId::from_parts(ts, rand as u128);
            let parsed: PodId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
