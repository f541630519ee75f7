//! Human-readable byte size parsing (`"10GiB"`, `"500MB"`, `"1024"`, ...).

/// Parses a decimal number followed by an optional unit into a byte count.
///
/// Accepted units (case-insensitive): `B`, `K`/`KB`/`KiB`, `M`/`MB`/`MiB`,
/// `G`/`GB`/`GiB`, `T`/`TB`/`TiB`. All multipliers use base 1024 regardless of
/// the `B`/`iB` spelling, matching the filesystem's own free-space units. An
/// empty unit means bytes. Returns `None` on malformed input; callers should
/// treat that as "unset, use the default".
#[must_use]
pub fn parse_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num_str, unit_str) = if split_at == 0 {
        return None;
    } else {
        s.split_at(split_at)
    };

    let num: f64 = num_str.parse().ok()?;
    if num < 0.0 {
        return None;
    }

    let unit = unit_str.trim().to_ascii_lowercase();
    let multiplier: u64 = match unit.as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024u64.pow(4),
        _ => return None,
    };

    // Fits comfortably below u64::MAX for any realistic disk/cache size.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some((num * multiplier as f64) as u64)
}
