use dashmap::DashMap;

/// Validation outcome for a GSTIN string.
///
/// `InvalidChecksum` is distinct from `InvalidFormat` on purpose: a
/// structurally sound GSTIN with a bad check digit is usually an OCR misread
/// of a real registration, so the normalizer keeps the record and downgrades
/// its confidence instead of rejecting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GstinValidity {
    Valid,
    InvalidChecksum,
    InvalidFormat,
}

const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn char_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'A'..=b'Z' => Some((c - b'A') as u32 + 10),
        _ => None,
    }
}

/// Structural check: 2-digit state code, PAN segment
/// (`[A-Z]{5}[0-9]{4}[A-Z]`), entity code `[1-9A-Z]`, literal `Z`, check
/// character.
fn well_formed(b: &[u8]) -> bool {
    b.len() == 15
        && b[0].is_ascii_digit()
        && b[1].is_ascii_digit()
        && b[2..7].iter().all(u8::is_ascii_uppercase)
        && b[7..11].iter().all(u8::is_ascii_digit)
        && b[11].is_ascii_uppercase()
        && (b[12].is_ascii_uppercase() || (b'1'..=b'9').contains(&b[12]))
        && b[13] == b'Z'
        && (b[14].is_ascii_uppercase() || b[14].is_ascii_digit())
}

/// Mod-36 check character over the first 14 characters. Factor alternates
/// 1, 2 from the leftmost character; each product contributes its base-36
/// digit sum.
fn check_char(b: &[u8]) -> u8 {
    let mut sum: u32 = 0;
    for (i, &c) in b[..14].iter().enumerate() {
        let factor = if i % 2 == 0 { 1 } else { 2 };
        // well_formed has already constrained the alphabet
        let product = char_value(c).unwrap_or(0) * factor;
        sum += product / 36 + product % 36;
    }
    ALPHABET[((36 - sum % 36) % 36) as usize]
}

/// Pure validation: structure first, then checksum.
pub fn validate(gstin: &str) -> GstinValidity {
    let b = gstin.as_bytes();
    if !well_formed(b) {
        return GstinValidity::InvalidFormat;
    }
    if check_char(b) == b[14] {
        GstinValidity::Valid
    } else {
        GstinValidity::InvalidChecksum
    }
}

/// Two-digit state code of a well-formed GSTIN.
pub fn state_code(gstin: &str) -> Option<&str> {
    if well_formed(gstin.as_bytes()) {
        Some(&gstin[..2])
    } else {
        None
    }
}

/// PAN segment (characters 3..13) of a well-formed GSTIN.
pub fn pan_segment(gstin: &str) -> Option<&str> {
    if well_formed(gstin.as_bytes()) {
        Some(&gstin[2..12])
    } else {
        None
    }
}

/// True when `a` and `b` are within edit distance 1 (single substitution,
/// insertion, or deletion). Used to recover from single-character OCR
/// misreads when bucketing low-confidence records.
pub fn within_edit_distance_one(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    match a.len().abs_diff(b.len()) {
        0 => a.iter().zip(b).filter(|(x, y)| x != y).count() <= 1,
        1 => {
            let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
            let mut skipped = false;
            let (mut i, mut j) = (0, 0);
            while i < short.len() {
                if short[i] == long[j] {
                    i += 1;
                    j += 1;
                } else if skipped {
                    return false;
                } else {
                    skipped = true;
                    j += 1;
                }
            }
            true
        }
        _ => false,
    }
}

/// Run-scoped validation cache shared by parallel bucket workers. Explicitly
/// injected per reconciliation run rather than held as process-wide state, so
/// runs stay independently testable.
#[derive(Debug, Default)]
pub struct GstinCache {
    inner: DashMap<String, GstinValidity>,
}

impl GstinCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, gstin: &str) -> GstinValidity {
        if let Some(v) = self.inner.get(gstin) {
            return *v;
        }
        let v = validate(gstin);
        self.inner.insert(gstin.to_string(), v);
        v
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
