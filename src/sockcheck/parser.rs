//! Sockcheck test definition file: the nested record format and the test
//! compiler.
//!
//! The file is a dictionary of entries; each value is a quoted string or a
//! nested `{}` block. A top-level key `"port[@timeout][*reps]:SEND"` defines
//! one probe; keys inside its block are match templates (optionally
//! `MATCH:SEND` for chained states) whose values are either a decision
//! string (`accept`/`reject [reason]`) or a further block.

use std::sync::Arc;

use thiserror::Error;

use super::template::{Template, TemplateError};

#[derive(Debug, Error)]
pub enum TestDbError {
    #[error("syntax error at offset {0}: {1}")]
    Syntax(usize, &'static str),
    #[error("misformed sockcheck test {0:?}")]
    BadTest(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// One value in the record database.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    String(String),
    Object(Vec<(String, Record)>),
}

struct Scanner<'a> {
    text: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn skip_filler(&mut self) {
        loop {
            while self.pos < self.text.len() && self.text[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.text[self.pos..].starts_with(b"#") || self.text[self.pos..].starts_with(b"//")
            {
                while self.pos < self.text.len() && self.text[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_filler();
        self.text.get(self.pos).copied()
    }

    fn string(&mut self) -> Result<String, TestDbError> {
        self.skip_filler();
        match self.text.get(self.pos) {
            Some(b'"') => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.text.get(self.pos) {
                        Some(b'"') => {
                            self.pos += 1;
                            return Ok(out);
                        }
                        Some(b'\\') => {
                            self.pos += 1;
                            let Some(&escaped) = self.text.get(self.pos) else {
                                return Err(TestDbError::Syntax(self.pos, "dangling escape"));
                            };
                            out.push(escaped as char);
                            self.pos += 1;
                        }
                        Some(&c) => {
                            out.push(c as char);
                            self.pos += 1;
                        }
                        None => return Err(TestDbError::Syntax(self.pos, "unterminated string")),
                    }
                }
            }
            Some(_) => {
                let start = self.pos;
                while self
                    .text
                    .get(self.pos)
                    .map(|c| !c.is_ascii_whitespace() && !b"{};\"".contains(c))
                    .unwrap_or(false)
                {
                    self.pos += 1;
                }
                if self.pos == start {
                    return Err(TestDbError::Syntax(self.pos, "expected a string"));
                }
                Ok(String::from_utf8_lossy(&self.text[start..self.pos]).into_owned())
            }
            None => Err(TestDbError::Syntax(self.pos, "expected a string")),
        }
    }

    fn object(&mut self) -> Result<Vec<(String, Record)>, TestDbError> {
        let mut entries = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'}') => return Ok(entries),
                _ => {}
            }
            let key = self.string()?;
            let value = match self.peek() {
                Some(b'{') => {
                    self.pos += 1;
                    let inner = self.object()?;
                    if self.peek() != Some(b'}') {
                        return Err(TestDbError::Syntax(self.pos, "expected }"));
                    }
                    self.pos += 1;
                    Record::Object(inner)
                }
                Some(b';') => Record::String(String::new()),
                _ => Record::String(self.string()?),
            };
            if self.peek() == Some(b';') {
                self.pos += 1;
            }
            entries.push((key, value));
        }
    }
}

/// Parse a whole record file into its top-level entries.
pub fn parse_database(text: &str) -> Result<Vec<(String, Record)>, TestDbError> {
    let mut scanner = Scanner {
        text: text.as_bytes(),
        pos: 0,
    };
    let entries = scanner.object()?;
    if scanner.peek().is_some() {
        return Err(TestDbError::Syntax(scanner.pos, "trailing data"));
    }
    Ok(entries)
}

// ---------------------------------------------------------------------
// Test compilation

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Checking,
    Accept,
    Reject,
}

/// One state of a probe's Mealy machine.
#[derive(Debug)]
pub struct TestState {
    pub kind: Decision,
    /// Bytes to send at state entry (CHECKING states).
    pub send: Template,
    /// Decision reason (ACCEPT/REJECT states).
    pub reason: String,
    /// Ordered responses; the last is the implicit timeout/EOF/other path.
    pub responses: Vec<TestResponse>,
}

#[derive(Debug)]
pub struct TestResponse {
    /// `None` is the catch-all (`other`).
    pub pattern: Option<Template>,
    pub next: Arc<TestState>,
}

/// One configured probe.
#[derive(Debug)]
pub struct Test {
    pub port: u16,
    pub timeout: u64,
    pub reps: u32,
    pub entry: Arc<TestState>,
}

pub type TestList = Vec<Arc<Test>>;

fn compile_decision(text: &str) -> Arc<TestState> {
    let lower = text.to_ascii_lowercase();
    let (kind, rest) = if lower.starts_with("reject") {
        (Decision::Reject, &text[6..])
    } else if lower.starts_with("accept") {
        (Decision::Accept, &text[6..])
    } else {
        tracing::error!(decision = text, "unknown sockcheck decision, defaulting to accept");
        (Decision::Accept, "")
    };
    let reason = rest
        .strip_prefix([' ', ':'])
        .filter(|r| !r.is_empty())
        .unwrap_or("No explanation given");
    Arc::new(TestState {
        kind,
        send: Template::default(),
        reason: reason.to_string(),
        responses: Vec::new(),
    })
}

fn compile_state(
    send_text: &str,
    entries: &[(String, Record)],
) -> Result<Arc<TestState>, TestDbError> {
    let send = Template::compile(send_text, false)?;
    let mut responses = Vec::new();
    for (key, value) in entries {
        let (match_text, next_send) = match key.split_once(':') {
            Some((m, s)) => (m, s),
            None => (key.as_str(), ""),
        };
        let pattern = if match_text == "other" {
            None
        } else {
            Some(Template::compile(match_text, true)?)
        };
        let next = match value {
            Record::String(decision) => compile_decision(decision),
            Record::Object(inner) => compile_state(next_send, inner)?,
        };
        responses.push(TestResponse { pattern, next });
    }
    // The catch-all must exist and must be last.
    match responses.iter().position(|r| r.pattern.is_none()) {
        None => responses.push(TestResponse {
            pattern: None,
            next: compile_decision("accept"),
        }),
        Some(pos) => {
            let last = responses.len() - 1;
            responses.swap(pos, last);
        }
    }
    Ok(Arc::new(TestState {
        kind: Decision::Checking,
        send,
        reason: String::new(),
        responses,
    }))
}

/// Compile one `"port[@timeout][*reps]:SEND" { ... }` entry.
pub fn compile_test(key: &str, value: &Record) -> Result<Arc<Test>, TestDbError> {
    let Record::Object(entries) = value else {
        return Err(TestDbError::BadTest(key.to_string()));
    };
    let digits: String = key.chars().take_while(|c| c.is_ascii_digit()).collect();
    let port: u16 = digits
        .parse()
        .map_err(|_| TestDbError::BadTest(key.to_string()))?;
    let mut timeout: u64 = 5;
    let mut reps: u32 = 1;
    let mut send_text = None;
    let mut rest = &key[digits.len()..];
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('@') {
            let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
            timeout = digits.parse().unwrap_or(timeout);
            rest = &tail[digits.len()..];
        } else if let Some(tail) = rest.strip_prefix('*') {
            let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
            reps = digits.parse().unwrap_or(reps);
            rest = &tail[digits.len()..];
        } else if let Some(tail) = rest.strip_prefix(':') {
            send_text = Some(tail);
            rest = "";
        } else {
            return Err(TestDbError::BadTest(key.to_string()));
        }
    }
    let Some(send_text) = send_text else {
        return Err(TestDbError::BadTest(key.to_string()));
    };
    let entry = compile_state(send_text, entries)?;
    Ok(Arc::new(Test {
        port,
        timeout,
        reps,
        entry,
    }))
}

/// Compile a whole test database.
pub fn compile_tests(text: &str) -> Result<TestList, TestDbError> {
    let entries = parse_database(text)?;
    let mut tests = Vec::with_capacity(entries.len());
    for (key, value) in &entries {
        tests.push(compile_test(key, value)?);
    }
    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# SOCKSv4 and an HTTP CONNECT probe.
"1080@8:04=.=.=.=.=.=.=.=." {
    "5b" "reject:SOCKSv4 open proxy";
    "5a" "reject SOCKSv4 open relay";
    "other" "accept";
};
"3128*2:=C=O=N=N=E=C=T20$c=:=6=6=6=720=H=T=T=P=/=1=.=00d0a0d0a" {
    "=H=T=T=P=/=1=.=020=2=0=0" {
        "other" "reject:open HTTP CONNECT proxy";
    };
};
"#;

    #[test]
    fn parses_nested_records() {
        let entries = parse_database(SAMPLE).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].0.starts_with("1080@8:04"));
        let Record::Object(inner) = &entries[0].1 else {
            panic!("expected object");
        };
        assert_eq!(inner.len(), 3);
        assert_eq!(
            inner[0].1,
            Record::String("reject:SOCKSv4 open proxy".into())
        );
    }

    #[test]
    fn compiles_tests() {
        let tests = compile_tests(SAMPLE).unwrap();
        assert_eq!(tests.len(), 2);

        let socks = &tests[0];
        assert_eq!(socks.port, 1080);
        assert_eq!(socks.timeout, 8);
        assert_eq!(socks.reps, 1);
        assert_eq!(socks.entry.kind, Decision::Checking);
        assert_eq!(socks.entry.responses.len(), 3);
        // "other" stays last; decision states carry their reasons.
        assert!(socks.entry.responses[2].pattern.is_none());
        assert_eq!(socks.entry.responses[0].next.kind, Decision::Reject);
        assert_eq!(socks.entry.responses[0].next.reason, "SOCKSv4 open proxy");
        assert_eq!(socks.entry.responses[1].next.reason, "SOCKSv4 open relay");
        assert_eq!(socks.entry.responses[2].next.kind, Decision::Accept);

        let http = &tests[1];
        assert_eq!(http.port, 3128);
        assert_eq!(http.reps, 2);
        // Nested state: its implicit other was appended as accept.
        let nested = &http.entry.responses[0].next;
        assert_eq!(nested.kind, Decision::Checking);
        assert_eq!(nested.responses.len(), 1);
        assert_eq!(nested.responses[0].next.kind, Decision::Reject);
    }

    #[test]
    fn other_is_moved_to_the_end() {
        let text = r#"
"23:0d" {
    "other" "accept";
    "ff" "reject:telnet something";
};
"#;
        let tests = compile_tests(text).unwrap();
        let responses = &tests[0].entry.responses;
        assert_eq!(responses.len(), 2);
        assert!(responses[0].pattern.is_some());
        assert!(responses[1].pattern.is_none());
    }

    #[test]
    fn invalid_template_is_fatal() {
        let text = r#"
"23:zz" {
    "other" "accept";
};
"#;
        assert!(matches!(
            compile_tests(text),
            Err(TestDbError::Template(_))
        ));
    }

    #[test]
    fn missing_send_template_is_rejected() {
        let text = r#""23" { "other" "accept"; };"#;
        assert!(matches!(compile_tests(text), Err(TestDbError::BadTest(_))));
    }
}
