//! Cosmetic process summary for the `Ps` reply: the process subtree
//! hanging off the session's shell, scraped from `/proc`.

use std::collections::BTreeMap;
use std::fs;

#[derive(Debug, Clone)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    state: char,
    command: String,
}

/// Format the process tree rooted at `root_pid`, one line per process.
/// On systems without a readable `/proc` this degrades to a notice.
#[must_use]
pub fn ps_tree(root_pid: i32) -> String {
    let table = match read_proc() {
        Some(table) => table,
        None => return "process listing unavailable\r\n".to_string(),
    };

    let mut children: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    for entry in table.values() {
        children.entry(entry.ppid).or_default().push(entry.pid);
    }

    let mut out = format!("{:>7} {:>5} COMMAND\r\n", "PID", "STAT");
    let mut stack = vec![(root_pid, 0usize)];
    while let Some((pid, depth)) = stack.pop() {
        let Some(entry) = table.get(&pid) else {
            continue;
        };
        out.push_str(&format!(
            "{:>7} {:>5} {:indent$}{}\r\n",
            entry.pid,
            entry.state,
            "",
            entry.command,
            indent = depth * 2,
        ));
        if let Some(kids) = children.get(&pid) {
            // Reverse so the stack pops them in ascending pid order.
            for &kid in kids.iter().rev() {
                stack.push((kid, depth + 1));
            }
        }
    }
    out
}

fn read_proc() -> Option<BTreeMap<i32, ProcEntry>> {
    let mut table = BTreeMap::new();
    for entry in fs::read_dir("/proc").ok()? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some((ppid, state, comm)) = parse_stat(&stat) else {
            continue;
        };
        // Prefer the full command line; kernel threads and zombies have
        // an empty one.
        let command = fs::read(entry.path().join("cmdline"))
            .ok()
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                raw.split(|&b| b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_else(|| format!("[{comm}]"));
        table.insert(
            pid,
            ProcEntry {
                pid,
                ppid,
                state,
                command,
            },
        );
    }
    Some(table)
}

/// Pull `(ppid, state, comm)` out of a `/proc/<pid>/stat` line. The comm
/// field is parenthesized and may itself contain spaces and parens, so
/// everything is located relative to the last `)`.
fn parse_stat(stat: &str) -> Option<(i32, char, String)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((ppid, state, comm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stat_plain() {
        let line = "1234 (bash) S 1000 1234 1234 34816 0 4194304";
        let (ppid, state, comm) = parse_stat(line).unwrap();
        assert_eq!(ppid, 1000);
        assert_eq!(state, 'S');
        assert_eq!(comm, "bash");
    }

    #[test]
    fn parse_stat_comm_with_spaces_and_parens() {
        let line = "42 (tmux: server (1)) R 1 42 42 0 -1";
        let (ppid, state, comm) = parse_stat(line).unwrap();
        assert_eq!(ppid, 1);
        assert_eq!(state, 'R');
        assert_eq!(comm, "tmux: server (1)");
    }

    #[test]
    fn parse_stat_garbage() {
        assert!(parse_stat("").is_none());
        assert!(parse_stat("99 no-parens R 1").is_none());
    }

    #[test]
    fn tree_includes_self() {
        // Our own process must show up when rooted at our pid.
        let out = ps_tree(std::process::id() as i32);
        assert!(out.contains(&std::process::id().to_string()));
        assert!(out.starts_with("    PID  STAT COMMAND\r\n"));
    }
}
