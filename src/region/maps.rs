//! Minimal `/proc/self/maps` reader used to seed the region catalog.

use std::str::FromStr;

/// One line of the maps file, reduced to what region selection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub begin: usize,
    pub end: usize,
    pub read: bool,
    pub write: bool,
    pub private: bool,
    /// The trailing path column, if any (`/lib/...`, `[heap]`, `[stack]`).
    pub label: Option<String>,
}

impl Mapping {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }
}

impl FromStr for Mapping {
    type Err = String;

    fn from_str(line: &str) -> Result<Mapping, String> {
        let mut fields = line.split_whitespace();
        let range = fields.next().ok_or_else(|| "empty line".to_string())?;
        let perms = fields
            .next()
            .ok_or_else(|| format!("missing perms: {}", line))?;
        // offset, device, inode
        for _ in 0..3 {
            fields
                .next()
                .ok_or_else(|| format!("truncated line: {}", line))?;
        }
        let label = fields.next().map(str::to_owned);

        let (begin, end) = range
            .split_once('-')
            .ok_or_else(|| format!("bad range: {}", range))?;
        let begin =
            usize::from_str_radix(begin, 16).map_err(|e| format!("bad begin {}: {}", begin, e))?;
        let end = usize::from_str_radix(end, 16).map_err(|e| format!("bad end {}: {}", end, e))?;

        let perms = perms.as_bytes();
        if perms.len() != 4 {
            return Err(format!("bad perms: {}", line));
        }

        Ok(Mapping {
            begin,
            end,
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            private: perms[3] == b'p',
            label,
        })
    }
}

/// Parses every line of the calling process's maps file.
pub fn mappings_for_self() -> std::io::Result<Vec<Mapping>> {
    let contents = std::fs::read_to_string("/proc/self/maps")?;
    contents
        .lines()
        .map(|line| {
            line.parse()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
        .collect()
}

/// Whether this mapping is one the shadow manager should take over: a
/// writable private region that is either anonymous or the heap. Special
/// kernel regions and file-backed mappings stay untouched.
pub fn is_candidate(m: &Mapping) -> bool {
    if !m.read || !m.write || !m.private {
        return false;
    }
    match m.label.as_deref() {
        None | Some("[heap]") => true,
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_anonymous_line() {
        let m: Mapping = "7f5e8c000000-7f5e8c021000 rw-p 00000000 00:00 0"
            .parse()
            .unwrap();
        assert_eq!(m.begin, 0x7f5e8c000000);
        assert_eq!(m.end, 0x7f5e8c021000);
        assert!(m.read && m.write && m.private);
        assert_eq!(m.label, None);
        assert!(is_candidate(&m));
    }

    #[test]
    fn parses_labeled_lines() {
        let heap: Mapping = "55e0b0a00000-55e0b0a21000 rw-p 00000000 00:00 0 [heap]"
            .parse()
            .unwrap();
        assert_eq!(heap.label.as_deref(), Some("[heap]"));
        assert!(is_candidate(&heap));

        let stack: Mapping = "7ffc7a9c3000-7ffc7a9e4000 rw-p 00000000 00:00 0 [stack]"
            .parse()
            .unwrap();
        assert!(!is_candidate(&stack));

        let vdso: Mapping = "7ffc7a9f1000-7ffc7a9f3000 r-xp 00000000 00:00 0 [vdso]"
            .parse()
            .unwrap();
        assert!(!is_candidate(&vdso));
    }

    #[test]
    fn file_backed_and_readonly_are_skipped() {
        let lib: Mapping =
            "7f5e8c400000-7f5e8c422000 rw-p 00000000 08:01 1234 /usr/lib/libc.so.6"
                .parse()
                .unwrap();
        assert!(!is_candidate(&lib));

        let ro: Mapping = "7f5e8c000000-7f5e8c021000 r--p 00000000 00:00 0"
            .parse()
            .unwrap();
        assert!(!is_candidate(&ro));

        let shared: Mapping = "7f5e8c000000-7f5e8c021000 rw-s 00000000 00:00 0"
            .parse()
            .unwrap();
        assert!(!is_candidate(&shared));
    }

    #[test]
    fn own_maps_parse() {
        let maps = mappings_for_self().unwrap();
        assert!(!maps.is_empty());
        // The stack is always present.
        assert!(maps
            .iter()
            .any(|m| m.label.as_deref() == Some("[stack]")));
    }
}
