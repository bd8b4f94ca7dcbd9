use serde::Serialize;

/// Default size estimator: UTF-16 length of the value's JSON encoding, or
/// 256 when encoding fails.
pub fn estimate_size<V: Serialize>(value: &V) -> usize {
    match serde_json::to_string(value) {
        Ok(s) => s.encode_utf16().count(),
        Err(_) => 256,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_ascii_json() {
        let size = estimate_size(&42u32);
        assert_eq!(size, "42".encode_utf16().count());
    }
}
