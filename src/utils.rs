use sha2::{Digest, Sha256};

/// Calculate the SHA-256 hash of the given data
///
/// # Arguments
/// * `data` - The data to hash
///
/// # Returns
/// * `String` - The lowercase hex-encoded hash
///
/// # Example
/// ```
/// use ghostmesh::utils::calculate_hash;
///
/// let hash = calculate_hash("Hello, GhostMesh!");
/// assert_eq!(hash.len(), 64); // SHA-256 produces 32 bytes = 64 hex chars
/// ```
pub fn calculate_hash<T: AsRef<[u8]>>(data: T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Check if a hash meets the proof-of-work difficulty requirement
///
/// # Arguments
/// * `hash` - The hash to check
/// * `difficulty` - Number of leading zeros required
///
/// # Returns
/// * `bool` - True if the hash meets the difficulty requirement
pub fn hash_meets_difficulty(hash: &str, difficulty: u32) -> bool {
    if difficulty == 0 {
        return true;
    }
    let target = "0".repeat(difficulty as usize);
    hash.starts_with(&target)
}

/// Current wall-clock time as fractional seconds since the Unix epoch
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Format a timestamp for display
///
/// # Arguments
/// * `timestamp` - Seconds since the Unix epoch
///
/// # Returns
/// * `String` - The formatted timestamp
pub fn format_timestamp(timestamp: f64) -> String {
    use chrono::DateTime;
    let dt = DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_default();
    dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Encode bytes with the standard base64 alphabet
pub fn b64_encode<T: AsRef<[u8]>>(data: T) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data.as_ref())
}

/// Decode a standard-alphabet base64 string
pub fn b64_decode(data: &str) -> crate::Result<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| crate::NodeError::Serialization(e.to_string()))
}

/// Serde codec storing binary content as base64 text, both at rest and on the wire
pub mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::b64_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::b64_decode(&text).map_err(serde::de::Error::custom)
    }
}
