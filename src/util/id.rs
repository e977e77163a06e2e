const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode a counter as a short lowercase base36 token (used for operation ids).
pub fn encode_base36(mut v: u64) -> String {
    if v == 0 {
        return "0".to_string();
    }
    let mut s = String::new();
    while v > 0 {
        let idx = (v % 36) as usize;
        s.push(ALPHABET[idx] as char);
        v /= 36;
    }
    s.chars().rev().collect()
}

/// Inverse of `encode_base36`; rejects empty input, foreign characters and overflow.
pub fn decode_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let mut v: u64 = 0;
    for ch in s.chars() {
        let d = ch.to_digit(36)?;
        if ch.is_ascii_uppercase() {
            return None;
        }
        v = v.checked_mul(36)?.checked_add(u64::from(d))?;
    }
    Some(v)
}
