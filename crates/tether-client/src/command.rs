//! Escape-character commands (`^P :` by default).
//!
//! Each command is run twice: once in cooked mode (where printing and
//! prompting are safe) and once after the terminal is raw again (where
//! messages are sent to the server). The `raw` flag tells a command
//! which phase it is in.

use std::io::{self, Write as _};

use tracing::info;

use tether_protocol::MessageKind;

use crate::Runtime;

/// Split a command line into words, honoring single quotes, double
/// quotes, and backslash escapes.
pub fn split_line(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err("trailing backslash".to_string()),
                },
                _ => current.push(c),
            },
            _ => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_word = true;
                    }
                    None => return Err("trailing backslash".to_string()),
                },
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Quote a value so it survives being typed at a shell prompt.
#[must_use]
pub fn quote_shell(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Run one command in the given phase. Unknown commands complain in the
/// cooked phase only.
pub async fn run(raw: bool, runtime: &Runtime, args: &[String]) {
    let Some(name) = args.first() else {
        return;
    };
    match name.as_str() {
        "help" => {
            if raw {
                return;
            }
            println!("Commands:");
            println!("  dump    - dump server state to its log");
            println!("  env     - display environment variables of client");
            println!("  escapes - display escape sequences in save buffers");
            println!("  excl    - detach all other clients");
            println!("  list    - list all clients");
            println!("  ping    - round-trip check against the server");
            println!("  ps      - display processes on this session");
            println!("  save    - save buffer to FILE");
            println!("  setenv  - type environment variables into the shell");
            println!("  ssh     - re-forward SSH_AUTH_SOCK");
            println!("  tee     - tee all future output to FILE (- to close)");
            println!("  title   - set the title for this session");
        }
        "dump" => {
            if raw {
                send(runtime, MessageKind::Dump, b"").await;
            }
        }
        "env" | "getenv" => {
            if raw {
                return;
            }
            let names = &args[1..];
            if names.is_empty() {
                let mut vars: Vec<(String, String)> = std::env::vars().collect();
                vars.sort();
                for (name, value) in vars {
                    println!("{name}={}", quote_shell(&value));
                }
                return;
            }
            for name in names {
                match std::env::var(name) {
                    Ok(value) => println!("{name}={}", quote_shell(&value)),
                    Err(_) => println!("{name} not set"),
                }
            }
        }
        "escapes" => {
            if raw {
                return;
            }
            if args.len() != 2 {
                println!("usage: escapes [alt|normal]");
                return;
            }
            send(runtime, MessageKind::Escape, args[1].as_bytes()).await;
        }
        "excl" => {
            if raw {
                send(runtime, MessageKind::Exclusive, b"").await;
            }
        }
        "list" => {
            if raw {
                send(runtime, MessageKind::List, b"").await;
            }
        }
        "ping" => {
            if raw {
                return;
            }
            let start = std::time::Instant::now();
            match runtime.ping().await {
                Ok(()) => println!("ping: ok ({} ms)", start.elapsed().as_millis()),
                Err(e) => println!("ping: {e}"),
            }
        }
        "ps" => {
            if raw {
                return;
            }
            match runtime.ps().await {
                Ok(listing) => {
                    let _ = io::stdout().write_all(&listing);
                }
                Err(e) => println!("ps: {e}"),
            }
        }
        "save" => {
            if !raw && args.len() != 2 {
                println!("usage: save FILENAME");
                return;
            }
            if raw && args.len() == 2 {
                send(runtime, MessageKind::Save, args[1].as_bytes()).await;
            }
        }
        "setenv" => {
            if !raw {
                return;
            }
            for name in &args[1..] {
                if let Ok(value) = std::env::var(name) {
                    let typed = format!("{name}={}\r", quote_shell(&value));
                    if let Err(e) = runtime.writer.write(typed.as_bytes()).await {
                        info!("setenv {name}: {e}");
                    }
                }
            }
        }
        "ssh" => {
            if raw {
                runtime.send_forwards().await;
            }
        }
        "tee" => {
            if raw {
                return;
            }
            if args.len() != 2 {
                println!("usage: tee FILENAME");
                return;
            }
            runtime.tee.open(&args[1]);
        }
        "title" => {
            if raw {
                return;
            }
            if args.len() > 1 {
                let title = args[1..].join(" ");
                if let Err(e) = runtime.session.set_title(&title) {
                    println!("title: {e}");
                }
            }
            println!("{}: {}", runtime.session.name(), runtime.session.title());
        }
        other => {
            if !raw {
                println!("unknown command: {other}");
            }
        }
    }
}

async fn send(runtime: &Runtime, kind: MessageKind, payload: &[u8]) {
    if let Err(e) = runtime.writer.send(kind, payload).await {
        info!("sending {kind}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_words() {
        assert_eq!(
            split_line("save /tmp/out.txt").unwrap(),
            vec!["save", "/tmp/out.txt"]
        );
        assert_eq!(split_line("   spaced   out  ").unwrap(), vec!["spaced", "out"]);
        assert!(split_line("").unwrap().is_empty());
    }

    #[test]
    fn split_quoted_words() {
        assert_eq!(
            split_line("title 'my build box'").unwrap(),
            vec!["title", "my build box"]
        );
        assert_eq!(
            split_line("title \"a \\\"quoted\\\" word\"").unwrap(),
            vec!["title", "a \"quoted\" word"]
        );
        assert_eq!(split_line("a\\ b c").unwrap(), vec!["a b", "c"]);
        // Empty quoted strings still produce a word.
        assert_eq!(split_line("x '' y").unwrap(), vec!["x", "", "y"]);
    }

    #[test]
    fn split_rejects_unterminated() {
        assert!(split_line("title 'oops").is_err());
        assert!(split_line("bad \\").is_err());
    }

    #[test]
    fn quote_shell_escapes_specials() {
        assert_eq!(quote_shell("plain"), "\"plain\"");
        assert_eq!(quote_shell("a \"b\" $c"), "\"a \\\"b\\\" \\$c\"");
        assert_eq!(quote_shell("back\\slash"), "\"back\\\\slash\"");
    }
}
