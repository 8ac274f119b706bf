//! Line-based three-way merge
//!
//! Lines of `base` matched in both edited versions (longest common
//! subsequence) are sync points. Between sync points a chunk changed on only
//! one side takes that side; identical changes collapse; anything else becomes
//! a marked conflict block.

pub const MARKER_LEFT: &str = "<<<<<<< left";
pub const MARKER_SEPARATOR: &str = "=======";
pub const MARKER_RIGHT: &str = ">>>>>>> right";

/// Largest LCS table built; beyond it the differing middle is one conflict block
pub const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutput {
    pub content: String,
    /// Number of conflict blocks written into `content`
    pub conflicts: usize,
}

impl MergeOutput {
    pub fn is_clean(&self) -> bool {
        self.conflicts == 0
    }
}

/// For each line of `a`, the index of its matching line in `b`
fn lcs_matches(a: &[&str], b: &[&str]) -> Vec<Option<usize>> {
    let mut matches = vec![None; a.len()];

    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    for (i, m) in matches.iter_mut().enumerate().take(prefix) {
        *m = Some(i);
    }

    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    for k in 0..suffix {
        matches[a.len() - 1 - k] = Some(b.len() - 1 - k);
    }

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];
    let (n, m) = (a_mid.len(), b_mid.len());
    if n == 0 || m == 0 {
        return matches;
    }
    if n.saturating_mul(m) > MAX_LCS_CELLS {
        log::warn!(
            "[Merge] {}x{} line diff exceeds the LCS limit, leaving it unmatched",
            n,
            m
        );
        return matches;
    }

    // table[i][j] = LCS length of a_mid[i..] and b_mid[j..]
    let width = m + 1;
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if a_mid[i] == b_mid[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a_mid[i] == b_mid[j] {
            matches[prefix + i] = Some(prefix + j);
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }

    matches
}

struct Builder<'a> {
    lines: Vec<&'a str>,
    conflicts: usize,
}

impl<'a> Builder<'a> {
    fn chunk(&mut self, base: &[&'a str], left: &[&'a str], right: &[&'a str]) {
        if left == base {
            self.lines.extend_from_slice(right);
        } else if right == base || left == right {
            self.lines.extend_from_slice(left);
        } else {
            self.lines.push(MARKER_LEFT);
            self.lines.extend_from_slice(left);
            self.lines.push(MARKER_SEPARATOR);
            self.lines.extend_from_slice(right);
            self.lines.push(MARKER_RIGHT);
            self.conflicts += 1;
        }
    }
}

/// Merge two edits of `base`. Never drops either side's change: overlapping
/// edits come back as conflict blocks.
pub fn three_way_merge(base: &str, left: &str, right: &str) -> MergeOutput {
    let base_lines: Vec<&str> = base.lines().collect();
    let left_lines: Vec<&str> = left.lines().collect();
    let right_lines: Vec<&str> = right.lines().collect();

    let to_left = lcs_matches(&base_lines, &left_lines);
    let to_right = lcs_matches(&base_lines, &right_lines);

    let mut out = Builder {
        lines: Vec::with_capacity(base_lines.len().max(left_lines.len()).max(right_lines.len())),
        conflicts: 0,
    };
    let (mut b, mut l, mut r) = (0, 0, 0);

    loop {
        let sync = (b..base_lines.len()).find_map(|i| Some((i, to_left[i]?, to_right[i]?)));
        match sync {
            Some((i, li, ri)) => {
                out.chunk(&base_lines[b..i], &left_lines[l..li], &right_lines[r..ri]);
                out.lines.push(base_lines[i]);
                b = i + 1;
                l = li + 1;
                r = ri + 1;
            }
            None => {
                out.chunk(&base_lines[b..], &left_lines[l..], &right_lines[r..]);
                break;
            }
        }
    }

    let mut content = out.lines.join("\n");
    let trailing_newline = left.ends_with('\n') || right.ends_with('\n');
    if trailing_newline && !content.is_empty() {
        content.push('\n');
    }

    MergeOutput {
        content,
        conflicts: out.conflicts,
    }
}
