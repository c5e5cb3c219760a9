//! Service records and the record-set payload stored under each service key.

use serde::{Deserialize, Serialize};

/// Default SRV priority assigned to registrations.
pub const DEFAULT_PRIORITY: u16 = 10;

/// Default SRV weight assigned to registrations.
pub const DEFAULT_WEIGHT: u16 = 10;

/// One endpoint offering a service.
///
/// Serialized with the field names the registration API and stored payloads
/// have always used (`Priority`, `Weight`, `Port`, `Target`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRecord {
    /// SRV priority.
    #[serde(default)]
    pub priority: u16,
    /// SRV weight.
    #[serde(default)]
    pub weight: u16,
    /// Port the endpoint listens on.
    pub port: u16,
    /// Dot-terminated host name or address of the endpoint.
    pub target: String,
}

impl ServiceRecord {
    /// Create a record with the default priority and weight.
    pub fn new(target: impl Into<String>, port: u16) -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            weight: DEFAULT_WEIGHT,
            port,
            target: target.into(),
        }
    }

    /// Two records describe the same endpoint when target and port match.
    pub fn same_endpoint(&self, other: &ServiceRecord) -> bool {
        self.port == other.port && self.target == other.target
    }
}

/// Ordered endpoints currently backing a service name.
///
/// `(target, port)` pairs are unique within a set. An empty set means the
/// service does not exist and is never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceRecordSet(Vec<ServiceRecord>);

impl ServiceRecordSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a set from records, dropping later duplicates of an endpoint.
    pub fn from_records(records: impl IntoIterator<Item = ServiceRecord>) -> Self {
        let mut set = Self::new();
        for record in records {
            set.append(record);
        }
        set
    }

    /// Append `record` unless an endpoint with the same target and port exists.
    ///
    /// Returns `true` when the set changed.
    pub fn append(&mut self, record: ServiceRecord) -> bool {
        if self.contains_endpoint(&record) {
            return false;
        }
        self.0.push(record);
        true
    }

    /// Remove the first record matching `record` on target and port.
    ///
    /// Returns `true` when a record was removed.
    pub fn remove(&mut self, record: &ServiceRecord) -> bool {
        match self.0.iter().position(|r| r.same_endpoint(record)) {
            Some(idx) => {
                self.0.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Whether an endpoint with the same target and port is present.
    pub fn contains_endpoint(&self, record: &ServiceRecord) -> bool {
        self.0.iter().any(|r| r.same_endpoint(record))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set has no records.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate records in order.
    pub fn iter(&self) -> std::slice::Iter<'_, ServiceRecord> {
        self.0.iter()
    }

    /// Borrow the records as a slice.
    pub fn as_slice(&self) -> &[ServiceRecord] {
        &self.0
    }

    /// Consume the set into its records.
    pub fn into_records(self) -> Vec<ServiceRecord> {
        self.0
    }

    /// Encode as the JSON payload stored in the data store.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a stored JSON payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let records: Vec<ServiceRecord> = serde_json::from_slice(payload)?;
        Ok(Self::from_records(records))
    }
}

impl<'a> IntoIterator for &'a ServiceRecordSet {
    type Item = &'a ServiceRecord;
    type IntoIter = std::slice::Iter<'a, ServiceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_skips_duplicate_endpoint() {
        let mut set = ServiceRecordSet::new();
        assert!(set.append(ServiceRecord::new("10.0.0.1.", 9000)));
        assert!(!set.append(ServiceRecord {
            priority: 1,
            weight: 1,
            port: 9000,
            target: "10.0.0.1.".to_string(),
        }));
        assert_eq!(set.len(), 1);
        assert_eq!(set.as_slice()[0].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_same_target_different_port_is_distinct() {
        let mut set = ServiceRecordSet::new();
        set.append(ServiceRecord::new("10.0.0.1.", 9000));
        set.append(ServiceRecord::new("10.0.0.1.", 9001));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove_first_match_only() {
        let mut set = ServiceRecordSet::from_records([
            ServiceRecord::new("a.", 1),
            ServiceRecord::new("b.", 2),
            ServiceRecord::new("c.", 3),
        ]);
        assert!(set.remove(&ServiceRecord::new("b.", 2)));
        assert!(!set.remove(&ServiceRecord::new("b.", 2)));
        let targets: Vec<&str> = set.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["a.", "c."]);
    }

    #[test]
    fn test_payload_round_trip_preserves_order_and_fields() {
        let set = ServiceRecordSet::from_records([
            ServiceRecord {
                priority: 5,
                weight: 20,
                port: 8080,
                target: "b.example.".to_string(),
            },
            ServiceRecord::new("a.example.", 9090),
        ]);

        let payload = set.to_payload().unwrap();
        let decoded = ServiceRecordSet::from_payload(&payload).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_payload_uses_pascal_case_fields() {
        let set = ServiceRecordSet::from_records([ServiceRecord::new("10.0.0.1.", 9000)]);
        let json: serde_json::Value = serde_json::from_slice(&set.to_payload().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"Priority": 10, "Weight": 10, "Port": 9000, "Target": "10.0.0.1."}
            ])
        );
    }

    #[test]
    fn test_from_payload_deduplicates() {
        let payload = br#"[{"Port":1,"Target":"a."},{"Port":1,"Target":"a."}]"#;
        let set = ServiceRecordSet::from_payload(payload).unwrap();
        assert_eq!(set.len(), 1);
    }
}
