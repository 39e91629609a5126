use regex::{Regex, RegexBuilder};

use crate::{Error, Result};

/// The request attributes a filter expression can look at.
pub trait Matchable {
    fn method(&self) -> &str;
    fn host(&self) -> &str;
    fn url(&self) -> String;
    fn headers(&self) -> &[(String, String)];
    fn is_http2(&self) -> bool;
    fn is_tls(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub expression: String,
    pub compiled: CompiledFilter,
}

#[derive(Debug, Clone)]
pub enum CompiledFilter {
    Always,
    Method(String),
    Host(Regex),
    Url(Regex),
    Header { name: String, pattern: Regex },
    Request,
    Http2,
    Tls,
    And(Box<CompiledFilter>, Box<CompiledFilter>),
    Or(Box<CompiledFilter>, Box<CompiledFilter>),
    Not(Box<CompiledFilter>),
}

impl Filter {
    pub fn new(expression: &str) -> Result<Self> {
        Ok(Self {
            expression: expression.to_string(),
            compiled: compile(expression)?,
        })
    }

    pub fn matches<M: Matchable + ?Sized>(&self, target: &M) -> bool {
        self.compiled.matches(target)
    }
}

fn regex(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| Error::filter(format!("invalid regex {:?}: {}", pattern, e)))
}

fn compile(expr: &str) -> Result<CompiledFilter> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(CompiledFilter::Always);
    }

    if let Some(pos) = find_operator(expr, '|') {
        return Ok(CompiledFilter::Or(
            Box::new(compile(&expr[..pos])?),
            Box::new(compile(&expr[pos + 1..])?),
        ));
    }
    if let Some(pos) = find_operator(expr, '&') {
        return Ok(CompiledFilter::And(
            Box::new(compile(&expr[..pos])?),
            Box::new(compile(&expr[pos + 1..])?),
        ));
    }
    if let Some(inner) = expr.strip_prefix('!') {
        return Ok(CompiledFilter::Not(Box::new(compile(inner)?)));
    }
    if expr.starts_with('(') && expr.ends_with(')') {
        return compile(&expr[1..expr.len() - 1]);
    }

    let (token, arg) = match expr.split_once(char::is_whitespace) {
        Some((token, arg)) => (token, arg.trim()),
        None => (expr, ""),
    };

    match (token, arg.is_empty()) {
        ("~m", false) => Ok(CompiledFilter::Method(arg.to_ascii_uppercase())),
        ("~d", false) => Ok(CompiledFilter::Host(regex(arg, true)?)),
        ("~u", false) => Ok(CompiledFilter::Url(regex(arg, false)?)),
        ("~h", false) => {
            let (name, pattern) = arg.split_once(':').ok_or_else(|| {
                Error::filter(format!("~h expects \"name: pattern\", got {:?}", arg))
            })?;
            Ok(CompiledFilter::Header {
                name: name.trim().to_ascii_lowercase(),
                pattern: regex(pattern.trim(), false)?,
            })
        }
        ("~q", true) => Ok(CompiledFilter::Request),
        ("~http2", true) => Ok(CompiledFilter::Http2),
        ("~tls", true) => Ok(CompiledFilter::Tls),
        (t, _) if t.starts_with('~') => {
            Err(Error::filter(format!("unknown filter expression: {}", expr)))
        }
        // A bare pattern matches against the URL.
        _ => Ok(CompiledFilter::Url(regex(expr, false)?)),
    }
}

impl CompiledFilter {
    pub fn matches<M: Matchable + ?Sized>(&self, target: &M) -> bool {
        match self {
            CompiledFilter::Always | CompiledFilter::Request => true,
            CompiledFilter::Method(method) => target.method().eq_ignore_ascii_case(method),
            CompiledFilter::Host(re) => re.is_match(target.host()),
            CompiledFilter::Url(re) => re.is_match(&target.url()),
            CompiledFilter::Header { name, pattern } => target
                .headers()
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(name) && pattern.is_match(v)),
            CompiledFilter::Http2 => target.is_http2(),
            CompiledFilter::Tls => target.is_tls(),
            CompiledFilter::And(left, right) => left.matches(target) && right.matches(target),
            CompiledFilter::Or(left, right) => left.matches(target) || right.matches(target),
            CompiledFilter::Not(inner) => !inner.matches(target),
        }
    }
}

// Position of `op` outside any parentheses.
fn find_operator(expr: &str, op: char) -> Option<usize> {
    let mut depth = 0i32;
    for (i, ch) in expr.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            c if c == op && depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Req {
        method: &'static str,
        host: &'static str,
        path: &'static str,
        headers: Vec<(String, String)>,
        http2: bool,
    }

    impl Matchable for Req {
        fn method(&self) -> &str {
            self.method
        }
        fn host(&self) -> &str {
            self.host
        }
        fn url(&self) -> String {
            format!("https://{}{}", self.host, self.path)
        }
        fn headers(&self) -> &[(String, String)] {
            &self.headers
        }
        fn is_http2(&self) -> bool {
            self.http2
        }
        fn is_tls(&self) -> bool {
            true
        }
    }

    fn request() -> Req {
        Req {
            method: "GET",
            host: "api.example.com",
            path: "/v1/users",
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            http2: true,
        }
    }

    #[test]
    fn test_simple_filters() {
        let req = request();
        assert!(Filter::new("~m get").unwrap().matches(&req));
        assert!(!Filter::new("~m POST").unwrap().matches(&req));
        assert!(Filter::new("~d EXAMPLE").unwrap().matches(&req));
        assert!(Filter::new("~u /v1/").unwrap().matches(&req));
        assert!(Filter::new("~h accept: json").unwrap().matches(&req));
        assert!(Filter::new("~http2 & ~tls").unwrap().matches(&req));
        assert!(Filter::new("users$").unwrap().matches(&req));
        assert!(Filter::new("").unwrap().matches(&req));
    }

    #[test]
    fn test_logical_operators() {
        let req = request();
        assert!(Filter::new("~m POST | ~d example").unwrap().matches(&req));
        assert!(!Filter::new("~m POST & ~d example").unwrap().matches(&req));
        assert!(Filter::new("! ~m POST").unwrap().matches(&req));
        assert!(Filter::new("!(~m POST | ~d other) & ~q").unwrap().matches(&req));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(Filter::new("~h no-colon").is_err());
        assert!(Filter::new("~bogus").is_err());
        assert!(Filter::new("~d (").is_err());
    }
}
