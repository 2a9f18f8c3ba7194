//! Sockcheck template bytecode.
//!
//! Templates are sequences of two-character tokens: `=X` for a literal
//! character, a hex pair for a literal byte, `$v` for a variable expansion,
//! and `..` (input templates only) for any byte. They are compiled once at
//! load; an invalid template is a fatal configuration error.

use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template {0:?} has = at end; needs a second character")]
    DanglingEquals(String),
    #[error("template {0:?} refers to unknown variable {1:?} (pos {2})")]
    UnknownVariable(String, char, usize),
    #[error("template {0:?}: . is only valid in input templates")]
    WildcardInOutput(String),
    #[error("template {0:?} expects .. to come in twos (pos {1})")]
    LoneWildcard(String, usize),
    #[error("template {0:?} expects hex characters to come in twos (pos {1})")]
    LoneHexDigit(String, usize),
    #[error("template {0:?}: unrecognized character {1:?} (pos {2})")]
    BadCharacter(String, char, usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Literal(u8),
    /// Matches any single byte (input templates only).
    Any,
    /// One of `c` (client IP text), `i` (raw IPv4 bytes), `p` (port,
    /// network order), `u` (uplink hostname).
    Var(char),
}

/// A compiled template: the ops plus the original text (kept for reasons
/// and diagnostics).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    pub ops: Vec<Op>,
    pub text: String,
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Template {
    /// Compile and validate. `is_input` allows the `..` wildcard.
    pub fn compile(text: &str, is_input: bool) -> Result<Template, TemplateError> {
        let bytes = text.as_bytes();
        let mut ops = Vec::with_capacity(bytes.len() / 2);
        let mut pos = 0;
        while pos < bytes.len() {
            match bytes[pos] {
                b'=' => {
                    let Some(&ch) = bytes.get(pos + 1) else {
                        return Err(TemplateError::DanglingEquals(text.to_string()));
                    };
                    ops.push(Op::Literal(ch));
                }
                b'$' => {
                    let var = bytes.get(pos + 1).copied().unwrap_or(0) as char;
                    if !matches!(var, 'c' | 'i' | 'p' | 'u') {
                        return Err(TemplateError::UnknownVariable(text.to_string(), var, pos));
                    }
                    ops.push(Op::Var(var));
                }
                b'.' => {
                    if !is_input {
                        return Err(TemplateError::WildcardInOutput(text.to_string()));
                    }
                    if bytes.get(pos + 1) != Some(&b'.') {
                        return Err(TemplateError::LoneWildcard(text.to_string(), pos));
                    }
                    ops.push(Op::Any);
                }
                c if hex_value(c).is_some() => {
                    let Some(low) = bytes.get(pos + 1).copied().and_then(hex_value) else {
                        return Err(TemplateError::LoneHexDigit(text.to_string(), pos));
                    };
                    ops.push(Op::Literal(hex_value(c).unwrap() << 4 | low));
                }
                other => {
                    return Err(TemplateError::BadCharacter(
                        text.to_string(),
                        other as char,
                        pos,
                    ));
                }
            }
            pos += 2;
        }
        Ok(Template {
            ops,
            text: text.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Variable values for one scan attempt.
#[derive(Debug, Clone)]
pub struct ExpandCtx {
    pub client_ip: IpAddr,
    pub port: u16,
    pub uplink_host: String,
}

impl ExpandCtx {
    pub fn expand_var(&self, var: char) -> Vec<u8> {
        match var {
            'c' => self.client_ip.to_string().into_bytes(),
            'i' => match self.client_ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                // The raw-address expansion is IPv4-specific; v6 targets
                // contribute the mapped low bytes.
                IpAddr::V6(v6) => v6.octets()[12..].to_vec(),
            },
            'p' => self.port.to_be_bytes().to_vec(),
            'u' => self.uplink_host.clone().into_bytes(),
            other => {
                tracing::warn!(var = %other, "request to expand unknown sockcheck variable");
                Vec::new()
            }
        }
    }

    /// Render an output template into the bytes to send.
    pub fn render(&self, template: &Template) -> Vec<u8> {
        let mut out = Vec::new();
        for op in &template.ops {
            match op {
                Op::Literal(byte) => out.push(*byte),
                Op::Var(var) => out.extend_from_slice(&self.expand_var(*var)),
                Op::Any => {}
            }
        }
        out
    }
}

/// Match progress of one response pattern over the receive buffer.
#[derive(Debug, Clone)]
pub struct Cursor {
    template: Template,
    op_idx: usize,
    /// Position in the receive buffer this cursor has consumed up to.
    pub buf_pos: usize,
    /// Expansion in progress for a variable op.
    var_bytes: Option<(Vec<u8>, usize)>,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    /// Template fully matched.
    Matched,
    /// Needs more input.
    Waiting,
    /// Diverged from the input; disarmed.
    Dead,
}

impl Cursor {
    pub fn new(template: Template, start: usize) -> Self {
        Self {
            template,
            op_idx: 0,
            buf_pos: start,
            var_bytes: None,
            alive: true,
        }
    }

    /// Advance over the receive buffer as far as the input allows.
    pub fn advance(&mut self, buf: &[u8], ctx: &ExpandCtx) -> CursorStatus {
        if !self.alive {
            return CursorStatus::Dead;
        }
        loop {
            if self.op_idx >= self.template.ops.len() {
                return CursorStatus::Matched;
            }
            let Some(&byte) = buf.get(self.buf_pos) else {
                return CursorStatus::Waiting;
            };
            match &self.template.ops[self.op_idx] {
                Op::Literal(expected) => {
                    if byte != *expected {
                        self.alive = false;
                        return CursorStatus::Dead;
                    }
                    self.buf_pos += 1;
                    self.op_idx += 1;
                }
                Op::Any => {
                    self.buf_pos += 1;
                    self.op_idx += 1;
                }
                Op::Var(var) => {
                    // Expansion bytes are computed at cursor time and then
                    // matched one byte per step.
                    if self.var_bytes.is_none() {
                        self.var_bytes = Some((ctx.expand_var(*var), 0));
                    }
                    let (bytes, offset) = self.var_bytes.as_mut().unwrap();
                    if *offset >= bytes.len() {
                        self.var_bytes = None;
                        self.op_idx += 1;
                        continue;
                    }
                    if byte != bytes[*offset] {
                        self.alive = false;
                        return CursorStatus::Dead;
                    }
                    *offset += 1;
                    self.buf_pos += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExpandCtx {
        ExpandCtx {
            client_ip: "10.1.2.3".parse().unwrap(),
            port: 1080,
            uplink_host: "hub.example.net".into(),
        }
    }

    #[test]
    fn compile_literals_and_hex() {
        let t = Template::compile("=G=E=T20", false).unwrap();
        assert_eq!(
            t.ops,
            vec![
                Op::Literal(b'G'),
                Op::Literal(b'E'),
                Op::Literal(b'T'),
                Op::Literal(0x20)
            ]
        );
    }

    #[test]
    fn compile_rejects_bad_templates() {
        assert!(matches!(
            Template::compile("=", false),
            Err(TemplateError::DanglingEquals(_))
        ));
        assert!(matches!(
            Template::compile("$x", false),
            Err(TemplateError::UnknownVariable(_, 'x', 0))
        ));
        assert!(matches!(
            Template::compile("..", false),
            Err(TemplateError::WildcardInOutput(_))
        ));
        assert!(matches!(
            Template::compile(".x", true),
            Err(TemplateError::LoneWildcard(_, 0))
        ));
        assert!(matches!(
            Template::compile("4", true),
            Err(TemplateError::LoneHexDigit(_, 0))
        ));
        assert!(matches!(
            Template::compile("zz", true),
            Err(TemplateError::BadCharacter(_, 'z', 0))
        ));
    }

    #[test]
    fn render_expands_variables() {
        let t = Template::compile("04=x$p$i", false).unwrap();
        let rendered = ctx().render(&t);
        assert_eq!(rendered, vec![0x04, b'x', 0x04, 0x38, 10, 1, 2, 3]);
    }

    #[test]
    fn cursor_matches_literals() {
        let t = Template::compile("5b5a", true).unwrap();
        let mut cursor = Cursor::new(t, 0);
        assert_eq!(cursor.advance(&[0x5b], &ctx()), CursorStatus::Waiting);
        assert_eq!(cursor.advance(&[0x5b, 0x5a], &ctx()), CursorStatus::Matched);
    }

    #[test]
    fn cursor_wildcard_and_divergence() {
        let t = Template::compile("..=B", true).unwrap();
        let mut ok = Cursor::new(t.clone(), 0);
        assert_eq!(ok.advance(b"xB", &ctx()), CursorStatus::Matched);
        let mut bad = Cursor::new(t, 0);
        assert_eq!(bad.advance(b"xC", &ctx()), CursorStatus::Dead);
        assert!(!bad.alive);
    }

    #[test]
    fn cursor_variable_match_is_deferred() {
        let t = Template::compile("$p", true).unwrap();
        let mut cursor = Cursor::new(t, 0);
        // 1080 = 0x0438 in network order.
        assert_eq!(cursor.advance(&[0x04], &ctx()), CursorStatus::Waiting);
        assert_eq!(cursor.advance(&[0x04, 0x38], &ctx()), CursorStatus::Matched);

        let t = Template::compile("$p", true).unwrap();
        let mut cursor = Cursor::new(t, 0);
        assert_eq!(cursor.advance(&[0x04, 0x39], &ctx()), CursorStatus::Dead);
    }

    #[test]
    fn cursor_starts_mid_buffer() {
        let t = Template::compile("=B", true).unwrap();
        let mut cursor = Cursor::new(t, 1);
        assert_eq!(cursor.advance(b"AB", &ctx()), CursorStatus::Matched);
    }
}
