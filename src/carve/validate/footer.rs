//! Footer search for footer-delimited formats.

use memchr::memmem;

/// Outcome of scanning a window for a format footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FooterSearch {
    /// Region end, relative to the window start
    Found(usize),
    /// Footers exist but every region they close is under the floor
    TooSmall,
    Missing,
}

/// Scan `window` (which starts at the candidate header) for `footer`.
///
/// `end_of` maps a footer position to the region end, or `None` when that
/// footer occurrence cannot close a region (truncated trailer, say). An
/// occurrence whose region is shorter than `floor` is skipped so an early
/// stray footer (an embedded thumbnail's EOI, for instance) does not cut
/// the file short.
pub(crate) fn search<F>(
    window: &[u8],
    skip: usize,
    footer: &[u8],
    floor: u64,
    end_of: F,
) -> FooterSearch
where
    F: Fn(&[u8], usize) -> Option<usize>,
{
    if footer.is_empty() || skip >= window.len() {
        return FooterSearch::Missing;
    }

    let mut saw_small = false;
    for rel in memmem::find_iter(&window[skip..], footer) {
        let pos = skip + rel;
        let Some(end) = end_of(window, pos) else {
            continue;
        };
        if end > window.len() {
            continue;
        }
        if (end as u64) < floor {
            saw_small = true;
            continue;
        }
        return FooterSearch::Found(end);
    }

    if saw_small {
        FooterSearch::TooSmall
    } else {
        FooterSearch::Missing
    }
}

/// Region ends right after the footer bytes
pub(crate) fn after_footer(footer_len: usize) -> impl Fn(&[u8], usize) -> Option<usize> {
    move |_, pos| Some(pos + footer_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_first_footer_over_floor() {
        let mut data = vec![0u8; 100];
        data[0..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
        data[10..12].copy_from_slice(&[0xFF, 0xD9]);
        data[60..62].copy_from_slice(&[0xFF, 0xD9]);

        let found = search(&data, 3, &[0xFF, 0xD9], 32, after_footer(2));
        assert_eq!(found, FooterSearch::Found(62));

        let found = search(&data, 3, &[0xFF, 0xD9], 0, after_footer(2));
        assert_eq!(found, FooterSearch::Found(12));
    }

    #[test]
    fn too_small_when_all_footers_are_early() {
        let mut data = vec![0u8; 100];
        data[10..12].copy_from_slice(&[0xFF, 0xD9]);
        let found = search(&data, 3, &[0xFF, 0xD9], 64, after_footer(2));
        assert_eq!(found, FooterSearch::TooSmall);
    }

    #[test]
    fn missing_without_any_footer() {
        let data = vec![0x41u8; 64];
        let found = search(&data, 0, &[0xFF, 0xD9], 0, after_footer(2));
        assert_eq!(found, FooterSearch::Missing);
    }

    #[test]
    fn end_past_window_is_ignored() {
        let mut data = vec![0u8; 40];
        data[30..32].copy_from_slice(b"PK");
        let found = search(&data, 0, b"PK", 0, |_, pos| Some(pos + 22));
        assert_eq!(found, FooterSearch::Missing);
    }
}
