use crate::{*, error::*};
use std::fmt;

// Parsed C++ type name, as it appears in debug info, module interfaces, and user input.
// Only the subset we need: qualified names with template arguments, pointers, references, fixed-size arrays, nested typedefs.
// Function types, pointers to members, and such are not supported.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeExpr {
    Named {base: String, args: Vec<TemplateArg>},
    Pointer(Box<TypeExpr>),
    Reference(Box<TypeExpr>),
    Array(Box<TypeExpr>, usize),
    // Array whose length is a template parameter, e.g. T[N] in module interface declarations.
    DependentArray(Box<TypeExpr>, String),
    // E.g. std::array<int, 3>::value_type
    Nested(Box<TypeExpr>, String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TemplateArg {
    Type(TypeExpr),
    Value(i64),
}

impl TemplateArg {
    pub fn as_type(&self) -> Option<&TypeExpr> { match self { Self::Type(t) => Some(t), _ => None } }
    pub fn as_value(&self) -> Option<i64> { match self { &Self::Value(v) => Some(v), _ => None } }
}

// Inline namespaces that standard libraries wrap everything in. Stripped for lookups, so that
// "std::array<int, 3>" finds "std::__1::array<int, 3>" from libc++ debug info and vice versa.
const INLINE_NAMESPACES: &[&str] = &["__1", "__2", "__cxx11", "__debug"];

impl TypeExpr {
    pub fn named(base: &str) -> Self { Self::Named {base: base.to_string(), args: Vec::new()} }

    pub fn base_name(&self) -> Option<&str> { match self { Self::Named {base, ..} => Some(base), _ => None } }
    pub fn template_args(&self) -> &[TemplateArg] { match self { Self::Named {args, ..} => args, _ => &[] } }

    // First component of the qualified name, e.g. "std" for std::__1::array<int, 3>.
    pub fn top_namespace(&self) -> Option<&str> {
        let base = self.base_name()?;
        let i = base.find("::")?;
        Some(&base[..i])
    }

    pub fn canonical(&self) -> TypeExpr {
        match self {
            Self::Named {base, args} => {
                let base = if base.contains("::") {
                    base.split("::").filter(|c| !INLINE_NAMESPACES.contains(c)).collect::<Vec<_>>().join("::")
                } else {
                    base.clone()
                };
                let args = args.iter().map(|a| match a {
                    TemplateArg::Type(t) => TemplateArg::Type(t.canonical()),
                    TemplateArg::Value(v) => TemplateArg::Value(*v) }).collect();
                Self::Named {base, args}
            }
            Self::Pointer(t) => Self::Pointer(Box::new(t.canonical())),
            Self::Reference(t) => Self::Reference(Box::new(t.canonical())),
            Self::Array(t, n) => Self::Array(Box::new(t.canonical()), *n),
            Self::DependentArray(t, n) => Self::DependentArray(Box::new(t.canonical()), n.clone()),
            Self::Nested(t, name) => Self::Nested(Box::new(t.canonical()), name.clone()),
        }
    }

    // Replaces template parameter names (e.g. "T", "N") with arguments. Used when instantiating module interface templates.
    pub fn substitute(&self, params: &[(String, TemplateArg)]) -> Result<TypeExpr> {
        Ok(match self {
            Self::Named {base, args} if args.is_empty() => match params.iter().find(|(p, _)| p == base) {
                Some((_, TemplateArg::Type(t))) => t.clone(),
                Some((_, TemplateArg::Value(v))) => return err!(TypeMismatch, "template parameter {} is a value ({}), used as a type", base, v),
                None => self.clone(),
            }
            Self::Named {base, args} => {
                let mut new_args: Vec<TemplateArg> = Vec::new();
                for a in args {
                    new_args.push(match a {
                        TemplateArg::Type(Self::Named {base: p, args: pa}) if pa.is_empty() => match params.iter().find(|(name, _)| name == p) {
                            Some((_, v)) => v.clone(),
                            None => a.clone(),
                        }
                        TemplateArg::Type(t) => TemplateArg::Type(t.substitute(params)?),
                        TemplateArg::Value(_) => a.clone(),
                    });
                }
                Self::Named {base: base.clone(), args: new_args}
            }
            Self::Pointer(t) => Self::Pointer(Box::new(t.substitute(params)?)),
            Self::Reference(t) => Self::Reference(Box::new(t.substitute(params)?)),
            Self::Array(t, n) => Self::Array(Box::new(t.substitute(params)?), *n),
            Self::DependentArray(t, n) => match params.iter().find(|(p, _)| p == n) {
                Some((_, TemplateArg::Value(v))) if *v >= 0 => Self::Array(Box::new(t.substitute(params)?), *v as usize),
                Some(_) => return err!(TypeMismatch, "array length {} is not a non-negative value", n),
                None => Self::DependentArray(Box::new(t.substitute(params)?), n.clone()),
            }
            Self::Nested(t, name) => Self::Nested(Box::new(t.substitute(params)?), name.clone()),
        })
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Named {base, args} => {
                write!(f, "{}", base)?;
                if !args.is_empty() {
                    write!(f, "<")?;
                    for (i, a) in args.iter().enumerate() {
                        if i != 0 {
                            write!(f, ", ")?;
                        }
                        match a {
                            TemplateArg::Type(t) => write!(f, "{}", t)?,
                            TemplateArg::Value(v) => write!(f, "{}", v)?,
                        }
                    }
                    write!(f, ">")?;
                }
                Ok(())
            }
            Self::Pointer(t) => write!(f, "{}*", t),
            Self::Reference(t) => write!(f, "{}&", t),
            Self::Array(t, n) => {
                // int[2][3] is an array of 2 arrays of 3 ints; print dimensions outermost first.
                let mut dims = vec![*n];
                let mut inner: &TypeExpr = t;
                while let Self::Array(t2, n2) = inner {
                    dims.push(*n2);
                    inner = t2;
                }
                write!(f, "{}", inner)?;
                for d in dims {
                    write!(f, "[{}]", d)?;
                }
                Ok(())
            }
            Self::DependentArray(t, n) => write!(f, "{}[{}]", t, n),
            Self::Nested(t, name) => write!(f, "{}::{}", t, name),
        }
    }
}

// Words that combine into one builtin type name, like "unsigned long long".
const MULTIWORD_PARTS: &[&str] = &["unsigned", "signed", "short", "long", "int", "char", "double"];

pub fn parse_type_name(s: &str) -> Result<TypeExpr> {
    let mut p = TypeNameParser {s: s.as_bytes(), pos: 0, text: s};
    let t = p.parse_type()?;
    p.skip_spaces();
    if p.pos != p.s.len() {
        return err!(Syntax, "unexpected '{}' in type name '{}'", &s[p.pos..], s);
    }
    Ok(t)
}

// Normalized spelling: "std::array<int,3>" -> "std::array<int, 3>".
pub fn normalize_type_name(s: &str) -> Result<String> {
    Ok(parse_type_name(s)?.to_string())
}

enum ArrayDim {
    Len(usize),
    Param(String),
}

struct TypeNameParser<'a> {
    s: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl<'a> TypeNameParser<'a> {
    fn skip_spaces(&mut self) {
        while self.pos < self.s.len() && self.s[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_spaces();
        self.s.get(self.pos).copied()
    }

    fn eat_if(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek_identifier(&mut self) -> Option<&'a str> {
        self.skip_spaces();
        let start = self.pos;
        let mut end = start;
        while end < self.s.len() && (self.s[end].is_ascii_alphanumeric() || self.s[end] == b'_') {
            end += 1;
        }
        if end == start || self.s[start].is_ascii_digit() {
            return None;
        }
        let text: &'a str = self.text;
        Some(&text[start..end])
    }

    fn eat_identifier(&mut self) -> Option<&'a str> {
        let r = self.peek_identifier()?;
        self.pos += r.len();
        Some(r)
    }

    fn eat_qualifier_separator(&mut self) -> bool {
        self.skip_spaces();
        if self.s[self.pos..].starts_with(b"::") {
            self.pos += 2;
            true
        } else {
            false
        }
    }

    fn skip_cv(&mut self) {
        while let Some(w) = self.peek_identifier() {
            if w != "const" && w != "volatile" {
                break;
            }
            self.pos += w.len();
        }
    }

    fn parse_type(&mut self) -> Result<TypeExpr> {
        self.skip_cv();
        let Some(first) = self.eat_identifier() else { return err!(Syntax, "expected type name at '{}'", &self.text[self.pos..]) };
        let mut base = first.to_string();
        if MULTIWORD_PARTS.contains(&first) {
            while let Some(w) = self.peek_identifier() {
                if !MULTIWORD_PARTS.contains(&w) {
                    break;
                }
                self.pos += w.len();
                base.push(' ');
                base.push_str(w);
            }
        } else {
            while self.eat_qualifier_separator() {
                let Some(w) = self.eat_identifier() else { return err!(Syntax, "expected identifier after '::' in '{}'", self.text) };
                base.push_str("::");
                base.push_str(w);
            }
        }

        let mut args: Vec<TemplateArg> = Vec::new();
        if self.eat_if(b'<') {
            if !self.eat_if(b'>') {
                loop {
                    args.push(self.parse_template_arg()?);
                    if self.eat_if(b'>') {
                        break;
                    }
                    if !self.eat_if(b',') {
                        return err!(Syntax, "expected ',' or '>' in template arguments of '{}'", self.text);
                    }
                }
            }
        }
        let mut t = TypeExpr::Named {base, args};

        while self.eat_qualifier_separator() {
            let Some(w) = self.eat_identifier() else { return err!(Syntax, "expected identifier after '::' in '{}'", self.text) };
            t = TypeExpr::Nested(Box::new(t), w.to_string());
        }

        let mut dims: Vec<ArrayDim> = Vec::new();
        loop {
            self.skip_cv();
            if self.eat_if(b'*') {
                t = TypeExpr::Pointer(Box::new(t));
            } else if self.eat_if(b'&') {
                self.eat_if(b'&');
                t = TypeExpr::Reference(Box::new(t));
            } else if self.eat_if(b'[') {
                let dim = match self.eat_identifier() {
                    Some(param) => ArrayDim::Param(param.to_string()),
                    None => {
                        let n = self.parse_integer()?;
                        if n < 0 {
                            return err!(Syntax, "negative array length in '{}'", self.text);
                        }
                        ArrayDim::Len(n as usize)
                    }
                };
                if !self.eat_if(b']') {
                    return err!(Syntax, "expected ']' in '{}'", self.text);
                }
                dims.push(dim);
            } else {
                break;
            }
        }
        for d in dims.into_iter().rev() {
            t = match d {
                ArrayDim::Len(n) => TypeExpr::Array(Box::new(t), n),
                ArrayDim::Param(p) => TypeExpr::DependentArray(Box::new(t), p),
            };
        }
        Ok(t)
    }

    fn parse_template_arg(&mut self) -> Result<TemplateArg> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == b'-' => return Ok(TemplateArg::Value(self.parse_integer()?)),
            _ => (),
        }
        match self.peek_identifier() {
            Some("true") => { self.pos += 4; return Ok(TemplateArg::Value(1)); }
            Some("false") => { self.pos += 5; return Ok(TemplateArg::Value(0)); }
            _ => (),
        }
        Ok(TemplateArg::Type(self.parse_type()?))
    }

    fn parse_integer(&mut self) -> Result<i64> {
        self.skip_spaces();
        let start = self.pos;
        if self.pos < self.s.len() && self.s[self.pos] == b'-' {
            self.pos += 1;
        }
        while self.pos < self.s.len() && self.s[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let text: &'a str = self.text;
        let digits = &text[start..self.pos];
        // Integer suffixes, as in std::array<int, 3ul>.
        while self.pos < self.s.len() && b"uUlL".contains(&self.s[self.pos]) {
            self.pos += 1;
        }
        if digits.is_empty() || digits == "-" {
            return err!(Syntax, "expected integer at '{}'", &text[start..]);
        }
        Ok(digits.parse::<i64>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::type_name::*;

    #[test]
    fn parse_and_print() {
        let t = parse_type_name("std::array<int,3>").unwrap();
        assert_eq!(t.to_string(), "std::array<int, 3>");
        assert_eq!(t.base_name(), Some("std::array"));
        assert_eq!(t.template_args(), &[TemplateArg::Type(TypeExpr::named("int")), TemplateArg::Value(3)]);

        assert_eq!(normalize_type_name("const unsigned   long").unwrap(), "unsigned long");
        assert_eq!(normalize_type_name("std::reverse_iterator<int *>").unwrap(), "std::reverse_iterator<int*>");
        assert_eq!(normalize_type_name("std::array<std::array<char, 2ul>, 0>").unwrap(), "std::array<std::array<char, 2>, 0>");
        assert_eq!(normalize_type_name("int[2][3]").unwrap(), "int[2][3]");
        assert_eq!(normalize_type_name("DbgInfo const&").unwrap(), "DbgInfo&");
        assert_eq!(normalize_type_name("std::array<int, 3>::value_type").unwrap(), "std::array<int, 3>::value_type");
    }

    #[test]
    fn multidimensional_array_nesting() {
        let t = parse_type_name("int[2][3]").unwrap();
        match t {
            TypeExpr::Array(inner, 2) => assert_eq!(*inner, TypeExpr::Array(Box::new(TypeExpr::named("int")), 3)),
            _ => panic!("unexpected {:?}", t),
        }
    }

    #[test]
    fn canonical_strips_inline_namespaces() {
        let t = parse_type_name("std::__1::array<std::__1::reverse_iterator<int*>, 1>").unwrap();
        assert_eq!(t.top_namespace(), Some("std"));
        assert_eq!(t.canonical().to_string(), "std::array<std::reverse_iterator<int*>, 1>");
        assert_eq!(parse_type_name("DbgInfo").unwrap().top_namespace(), None);
    }

    #[test]
    fn substitute_params() {
        let pattern = parse_type_name("std::reverse_iterator<T*>").unwrap();
        let params = vec![("T".to_string(), TemplateArg::Type(TypeExpr::named("DbgInfo"))), ("N".to_string(), TemplateArg::Value(1))];
        assert_eq!(pattern.substitute(&params).unwrap().to_string(), "std::reverse_iterator<DbgInfo*>");
        let array = parse_type_name("foo<T, N>").unwrap();
        assert_eq!(array.substitute(&params).unwrap().to_string(), "foo<DbgInfo, 1>");
        assert!(parse_type_name("N*").unwrap().substitute(&params).unwrap_err().is_type_mismatch());
        assert_eq!(parse_type_name("T[N]").unwrap().substitute(&params).unwrap().to_string(), "DbgInfo[1]");
        assert_eq!(parse_type_name("T[N]").unwrap().to_string(), "T[N]");
    }

    #[test]
    fn syntax_errors() {
        assert!(parse_type_name("std::array<int, 3").unwrap_err().is_syntax());
        assert!(parse_type_name("int[").unwrap_err().is_syntax());
        assert!(parse_type_name("int[-1]").unwrap_err().is_syntax());
        assert!(parse_type_name("").unwrap_err().is_syntax());
        assert!(parse_type_name("int)").unwrap_err().is_syntax());
    }
}
