//! Shell-style variable substitution over descriptor strings.
//!
//! Supports `$NAME`, `${NAME}`, `${NAME:-default}` and `${NAME-default}`
//! where NAME is `[A-Za-z0-9_]+`. Substitution is a single left-to-right
//! pass; replacement values are never rescanned and there is no escape
//! syntax. An unknown variable without a default expands to the empty
//! string and logs a warning.

use indexmap::IndexMap;
use tracing::warn;

/// An environment snapshot used to expand descriptor strings.
pub struct Substitutes {
    env: IndexMap<String, String>,
}

impl Substitutes {
    pub fn new(env: IndexMap<String, String>) -> Self {
        Self { env }
    }

    /// Expands all variable expressions in `input`.
    pub fn substitute(&self, input: &str) -> String {
        let bytes = input.as_bytes();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() {
                if bytes[i + 1] == b'{' {
                    if let Some(end) = input[i + 2..].find('}') {
                        let expr = &input[i + 2..i + 2 + end];
                        out.push_str(&self.expand_braced(expr));
                        i += 2 + end + 1;
                        continue;
                    }
                } else {
                    let name_len = bytes[i + 1..]
                        .iter()
                        .take_while(|b| is_name_byte(**b))
                        .count();
                    if name_len > 0 {
                        let name = &input[i + 1..i + 1 + name_len];
                        out.push_str(&self.lookup(name, None));
                        i += 1 + name_len;
                        continue;
                    }
                }
            }
            let c = input[i..].chars().next().expect("index is on a char boundary");
            out.push(c);
            i += c.len_utf8();
        }
        out
    }

    /// Expands the inside of a `${...}` expression.
    fn expand_braced(&self, expr: &str) -> String {
        let name_len = expr
            .bytes()
            .take_while(|b| is_name_byte(*b))
            .count();
        let name = &expr[..name_len];
        let rest = &expr[name_len..];
        let default = if let Some(d) = rest.strip_prefix(":-") {
            Some(d)
        } else {
            rest.strip_prefix('-')
        };
        // Anything else after the name is not a substitution operator; the
        // whole expression falls through as an undefined variable.
        if !rest.is_empty() && default.is_none() {
            warn!("malformed substitution expression ${{{expr}}}; treating as empty");
            return String::new();
        }
        self.lookup(name, default)
    }

    fn lookup(&self, name: &str, default: Option<&str>) -> String {
        if let Some(v) = self.env.get(name) {
            return v.clone();
        }
        match default {
            Some(d) => d.to_string(),
            None => {
                warn!("{name} env var is not set, defaulting to blank string");
                String::new()
            }
        }
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testee() -> Substitutes {
        let mut env = IndexMap::new();
        env.insert("VAR1".to_string(), "dyn1".to_string());
        env.insert("VAR2".to_string(), "dyn2".to_string());
        Substitutes::new(env)
    }

    fn assert_substitution(expected: &str, input: &str) {
        let actual = testee().substitute(input);
        assert_eq!(actual, expected, "substituting {input:?}");
    }

    #[test]
    fn plain_variables() {
        assert_substitution("static-dyn1", "static-$VAR1");
        assert_substitution("static-dyn1-XY", "static-$VAR1-XY");
        assert_substitution("static-dyn1-dyn2", "static-$VAR1-$VAR2");
        assert_substitution("static-dyn1-dyn2-", "static-$VAR1-$VAR2-$VAR3");
    }

    #[test]
    fn braced_variables() {
        assert_substitution("static-dyn1", "static-${VAR1}");
        assert_substitution("static-dyn1-XY", "static-${VAR1}-XY");
        assert_substitution("static-dyn1-dyn2", "static-${VAR1}-${VAR2}");
        assert_substitution("static-dyn1-dyn2-", "static-${VAR1}-${VAR2}-${VAR3}");
    }

    #[test]
    fn defaults() {
        assert_substitution("static-dyn1-dyn2-defaultval", "static-${VAR1}-${VAR2}-${VAR3-defaultval}");
        assert_substitution("static-dyn1-dyn2-defaultval", "static-${VAR1}-${VAR2}-${VAR3:-defaultval}");
        // A set variable ignores the default.
        assert_substitution("dyn1", "${VAR1:-other}");
    }

    #[test]
    fn no_recursion() {
        let mut env = IndexMap::new();
        env.insert("A".to_string(), "$B".to_string());
        env.insert("B".to_string(), "nested".to_string());
        let s = Substitutes::new(env);
        assert_eq!(s.substitute("$A"), "$B");
    }

    #[test]
    fn literal_text_untouched() {
        assert_substitution("no variables here", "no variables here");
        assert_substitution("$", "$");
        assert_substitution("100$ worth", "100$ worth");
    }
}
