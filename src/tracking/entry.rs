use serde::{Deserialize, Serialize};

/// One completed frame of a tracked call tree.
///
/// `start_time` is nanoseconds since the Unix epoch, `execution_time` is in
/// nanoseconds and `level` is the 1-based call depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathTrackingEntry {
    pub tracking_id: String,
    pub node_id: String,
    pub class_name: String,
    pub method_name: String,
    pub start_time: u64,
    pub execution_time: u64,
    pub level: u32,
}

/// Summary of one tracked transaction, used when listing transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathCallInformation {
    pub tracking_id: String,
    /// Start of the transaction's first entry, milliseconds since the epoch.
    pub start_time: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_uses_camel_case_fields() {
        let entry = PathTrackingEntry {
            tracking_id: "t-1".into(),
            node_id: "node".into(),
            class_name: "OrderService".into(),
            method_name: "place".into(),
            start_time: 1,
            execution_time: 2,
            level: 1,
        };
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["trackingId"], "t-1");
        assert_eq!(json["className"], "OrderService");
        assert_eq!(json["executionTime"], 2);
    }
}
