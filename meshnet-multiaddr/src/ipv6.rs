//! RFC 5952 canonical text representation of IPv6 addresses: lowercase hex,
//! no leading zeros in a group, longest run of zero groups compressed with
//! `::` (ties broken in favour of the left-most run), and zone identifiers
//! stripped for equality purposes (they are not part of the 16-byte binary
//! form anyway).

use std::net::Ipv6Addr;

/// Finds the longest run of all-zero 16-bit groups, preferring the
/// left-most run on a tie, and requiring the run to be at least 2 groups
/// long (a single zero group is not compressed, per RFC 5952 §4.2.2).
fn longest_zero_run(groups: &[u16; 8]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut run_start = None;

    for (index, &group) in groups.iter().enumerate() {
        if group == 0 {
            if run_start.is_none() {
                run_start = Some(index);
            }
        } else if let Some(start) = run_start.take() {
            record_run(&mut best, start, index - start);
        }
    }
    if let Some(start) = run_start {
        record_run(&mut best, start, groups.len() - start);
    }

    best.filter(|&(_, len)| len >= 2)
}

fn record_run(best: &mut Option<(usize, usize)>, start: usize, len: usize) {
    match best {
        Some((_, best_len)) if *best_len >= len => {}
        _ => *best = Some((start, len)),
    }
}

/// Renders `addr` using the RFC 5952 canonical form. Does not emit the
/// IPv4-mapped `::ffff:a.b.c.d` shorthand; the address model handles that
/// case explicitly where it is semantically meaningful.
pub fn to_canonical_string(addr: &Ipv6Addr) -> String {
    let groups = addr.segments();
    let compress = longest_zero_run(&groups);

    let mut out = String::with_capacity(39);
    let mut index = 0;
    while index < groups.len() {
        if let Some((start, len)) = compress {
            if index == start {
                out.push_str("::");
                index += len;
                continue;
            }
        }
        if !out.is_empty() && !out.ends_with("::") {
            out.push(':');
        }
        out.push_str(&format!("{:x}", groups[index]));
        index += 1;
    }
    if out.is_empty() {
        out.push_str("::");
    }
    out
}

/// Parses an IPv6 literal, accepting exactly one `::` run, an optional
/// trailing `%zone` (stripped, since it is outside the 16-byte binary form),
/// and the `::ffff:A.B.C.D` IPv4-mapped form.
pub fn parse(text: &str) -> Option<Ipv6Addr> {
    let without_zone = match text.split_once('%') {
        Some((addr, _zone)) => addr,
        None => text,
    };
    without_zone.parse::<Ipv6Addr>().ok()
}

/// Two IPv6 literals are equal iff their canonical forms (zone stripped)
/// are equal.
pub fn normalized_eq(a: &str, b: &str) -> bool {
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_longest_run() {
        let addr: Ipv6Addr = "2001:0db8:0000:0000:0000:0000:0000:0001".parse().unwrap();
        assert_eq!(to_canonical_string(&addr), "2001:db8::1");
    }

    #[test]
    fn prefers_leftmost_run_on_tie() {
        let addr: Ipv6Addr = "2001:0:0:1:0:0:0:1".parse().unwrap();
        // two runs of length 2 at offsets 1 and 4; canonical form compresses
        // the left-most.
        assert_eq!(to_canonical_string(&addr), "2001::1:0:0:0:1");
    }

    #[test]
    fn does_not_compress_single_zero_group() {
        let addr: Ipv6Addr = "2001:db8:0:1:1:1:1:1".parse().unwrap();
        assert_eq!(to_canonical_string(&addr), "2001:db8:0:1:1:1:1:1");
    }

    #[test]
    fn strips_zone_for_equality() {
        assert!(normalized_eq("fe80::1%eth0", "fe80::1"));
    }

    #[test]
    fn idempotent_normalization() {
        let once = to_canonical_string(&"::1".parse().unwrap());
        let twice = to_canonical_string(&once.parse().unwrap());
        assert_eq!(once, twice);
    }
}
