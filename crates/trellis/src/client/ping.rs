/// Converts a round-trip time in milliseconds into a selection weight:
///
/// 1. `weight = 191` if `t <= 10`
/// 2. `weight = 201 - t` if `10 < t <= 200`
/// 3. `weight = 1` if `200 < t < 1000`
/// 4. `weight = 0` if `t >= 1000`
///
/// Servers under 10 ms are strongly preferred and servers at or above
/// 1000 ms are never selected. The breakpoints are operational lore, not
/// derived from anything.
pub fn calculate_weight(rtt_ms: i64) -> i64 {
    if (0..=10).contains(&rtt_ms) {
        191
    } else if rtt_ms > 10 && rtt_ms <= 200 {
        201 - rtt_ms
    } else if rtt_ms > 100 && rtt_ms < 1000 {
        1
    } else {
        0
    }
}
