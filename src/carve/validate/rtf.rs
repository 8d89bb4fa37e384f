//! RTF groups: the document ends at the brace that balances the opening one.

/// Region end (exclusive) of the outermost group, or `None` if it never closes.
pub(crate) fn balanced_end(window: &[u8]) -> Option<usize> {
    if window.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut i = 0;
    while i < window.len() {
        match window[i] {
            b'\\' => {
                // control symbol: \{ \} \\ never change depth
                i += 2;
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}
