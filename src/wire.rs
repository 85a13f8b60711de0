//! Line-oriented tokenization (spec §6 "Parser contract (consumed)").
//!
//! spec.md treats this as an external collaborator; SPEC_FULL.md §3
//! provides the minimal concrete realization needed to drive the core
//! from a real socket.

/// A parsed line: verb, middle parameters, and an optional trailing
/// parameter (the `:`-prefixed final argument).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub verb: String,
    pub params: Vec<String>,
    pub trailing: Option<String>,
}

impl Parsed {
    /// `param(0)` is the first middle parameter, not the verb.
    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(|s| s.as_str())
    }
}

/// Tokenize one `\r\n`-stripped line of client or peer wire protocol.
///
/// Both forms (space-separated client commands and space-separated peer
/// tokens) share the same trailing-parameter convention, so one tokenizer
/// serves both per spec §6.
pub fn tokenize(line: &str) -> Option<Parsed> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    let (head, trailing) = match line.split_once(" :") {
        Some((h, t)) => (h, Some(t.to_string())),
        None => {
            if let Some(rest) = line.strip_prefix(':') {
                // A line that is *only* a trailing parameter, e.g. "EB" has
                // none, but something like ":bye" would land here.
                (rest, None)
            } else {
                (line, None)
            }
        }
    };
    let mut it = head.split_whitespace();
    let verb = it.next()?.to_string();
    let params: Vec<String> = it.map(|s| s.to_string()).collect();
    Some(Parsed {
        verb,
        params,
        trailing,
    })
}

/// Format a numeric reply line (spec §6 "Wire — client side").
pub fn numeric(from: &str, num: u16, tail: &str) -> String {
    format!(":{from} {num:03} {tail}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_client_privmsg() {
        let p = tokenize("PRIVMSG #x :hi there\r\n").unwrap();
        assert_eq!(p.verb, "PRIVMSG");
        assert_eq!(p.params, vec!["#x"]);
        assert_eq!(p.trailing.as_deref(), Some("hi there"));
    }

    #[test]
    fn tokenizes_peer_server_intro() {
        let p = tokenize("A S hub.example 1 100 100 J10 B :the hub\r\n").unwrap();
        assert_eq!(p.verb, "A");
        assert_eq!(
            p.params,
            vec!["S", "hub.example", "1", "100", "100", "J10", "B"]
        );
        assert_eq!(p.trailing.as_deref(), Some("the hub"));
    }

    #[test]
    fn empty_line_is_none() {
        assert!(tokenize("\r\n").is_none());
        assert!(tokenize("").is_none());
    }

    #[test]
    fn numeric_zero_pads() {
        assert_eq!(numeric("irc.test", 1, "welcome"), ":irc.test 001 welcome\r\n");
    }
}
