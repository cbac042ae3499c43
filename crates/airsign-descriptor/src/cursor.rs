//! Character cursor shared by the key, miniscript and descriptor parsers.

#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    pub fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    pub fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.s.len()
    }

    pub fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Consume `c` if it is next.
    pub fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    /// Consume `prefix` if the input continues with it.
    pub fn eat_str(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// Take everything up to (not including) the first char in `stops`.
    pub fn take_until(&mut self, stops: &[char]) -> &'a str {
        let rest = self.rest();
        let end = rest.find(|c| stops.contains(&c)).unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    /// Take a key expression: stops at `,` or `)` outside of `{}`/`<>`
    /// branch sets and `[]` origins.
    pub fn take_key(&mut self) -> &'a str {
        let rest = self.rest();
        let mut depth = 0usize;
        let mut end = rest.len();
        for (i, c) in rest.char_indices() {
            match c {
                '{' | '<' | '[' => depth += 1,
                '}' | '>' | ']' => depth = depth.saturating_sub(1),
                ',' | ')' if depth == 0 => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        self.pos += end;
        &rest[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_key_respects_branch_sets() {
        let mut c = Cursor::new("[aabbccdd/1h]xpub/{0,1}/*,next)");
        assert_eq!(c.take_key(), "[aabbccdd/1h]xpub/{0,1}/*");
        assert!(c.eat(','));
        assert_eq!(c.take_key(), "next");
        assert_eq!(c.peek(), Some(')'));
    }

    #[test]
    fn test_take_until() {
        let mut c = Cursor::new("and_v(v:pk(A),B)");
        assert_eq!(c.take_until(&['(']), "and_v");
        assert!(c.eat('('));
        assert!(c.eat_str("v:"));
        assert_eq!(c.rest(), "pk(A),B)");
    }
}
