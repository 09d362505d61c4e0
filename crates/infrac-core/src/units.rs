//! Size, percentage and CPU-set parsing shared by the decoder, the validator
//! and the resource allocator.

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Parse a byte size such as `512MiB`, `4GiB`, `2GB` or `1048576`.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier = match unit.trim() {
        "" | "B" => 1,
        "KiB" => KIB,
        "MiB" => MIB,
        "GiB" => GIB,
        "TiB" => TIB,
        "kB" | "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Parse `20%` into 20.
pub fn parse_percent(text: &str) -> Option<u64> {
    text.trim().strip_suffix('%')?.trim().parse().ok()
}

/// Count the cores named by an Incus `limits.cpu` value: `4`, `0-3` or `0,2,4`.
pub fn parse_cpu_count(text: &str) -> Option<u64> {
    let text = text.trim();
    if !text.contains(|c| c == '-' || c == ',') {
        return text.parse().ok();
    }
    let mut count = 0u64;
    for part in text.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u64 = lo.trim().parse().ok()?;
                let hi: u64 = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                count = count.checked_add((hi - lo).checked_add(1)?)?;
            }
            None => {
                part.parse::<u64>().ok()?;
                count = count.checked_add(1)?;
            }
        }
    }
    Some(count)
}
