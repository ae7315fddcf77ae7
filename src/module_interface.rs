use crate::{*, error::*, type_name::*};
use std::collections::HashMap;

// A module interface is a precompiled description of a library's declarations: enough to fill gaps in debug info
// (member names and types, nested typedefs) without compiling anything. Layout is not stored, it's computed
// from member types when instantiating, and debug info wins whenever it has the layout.
//
// Text format, one declaration per block:
//
//   module std
//   template std::array<class T, size_t N>
//     field __elems_ T[N]
//     typedef value_type T
//   end
//   struct std::nullopt_t
//     field __v int
//   end
//
// '#' starts a comment. Names are canonical (no inline namespaces).

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateParam {
    pub name: String,
    pub is_value: bool, // non-type parameter, like `size_t N`
}

#[derive(Clone, Debug)]
pub struct Declaration {
    pub name: String,
    pub params: Vec<TemplateParam>,
    pub fields: Vec<(String, TypeExpr)>,
    pub typedefs: Vec<(String, TypeExpr)>,
}

// A declaration with template arguments plugged in.
#[derive(Clone, Debug)]
pub struct Instantiation {
    pub fields: Vec<(String, TypeExpr)>,
    pub typedefs: Vec<(String, String)>,
}

impl Declaration {
    pub fn instantiate(&self, args: &[TemplateArg]) -> Result<Instantiation> {
        if args.len() != self.params.len() {
            return err!(TypeMismatch, "{} expects {} template arguments, got {}", self.name, self.params.len(), args.len());
        }
        let mut bindings: Vec<(String, TemplateArg)> = Vec::new();
        for (p, a) in self.params.iter().zip(args) {
            match (p.is_value, a) {
                (true, TemplateArg::Value(_)) | (false, TemplateArg::Type(_)) => (),
                (true, _) => return err!(TypeMismatch, "template parameter {} of {} expects a value", p.name, self.name),
                (false, _) => return err!(TypeMismatch, "template parameter {} of {} expects a type", p.name, self.name),
            }
            bindings.push((p.name.clone(), a.clone()));
        }
        let mut fields: Vec<(String, TypeExpr)> = Vec::new();
        for (name, t) in &self.fields {
            fields.push((name.clone(), t.substitute(&bindings)?));
        }
        let mut typedefs: Vec<(String, String)> = Vec::new();
        for (name, t) in &self.typedefs {
            typedefs.push((name.clone(), t.substitute(&bindings)?.to_string()));
        }
        Ok(Instantiation {fields, typedefs})
    }
}

#[derive(Debug)]
pub struct ModuleInterface {
    pub name: String,
    declarations: HashMap<String, Declaration>,
}

impl ModuleInterface {
    pub fn find(&self, base_name: &str) -> Option<&Declaration> { self.declarations.get(base_name) }
    pub fn num_declarations(&self) -> usize { self.declarations.len() }

    pub fn parse(text: &str) -> Result<Self> {
        let mut name: Option<String> = None;
        let mut declarations: HashMap<String, Declaration> = HashMap::new();
        let mut current: Option<Declaration> = None;
        for (line_idx, line) in text.lines().enumerate() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (keyword, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (line, "") };
            let res = parse_line(keyword, rest, &mut name, &mut current, &mut declarations);
            res.map_err(|e| error!(Syntax, "module interface line {}: {}", line_idx + 1, e))?;
        }
        if let Some(d) = current {
            return err!(Syntax, "module interface: declaration of {} is missing 'end'", d.name);
        }
        let Some(name) = name else { return err!(Syntax, "module interface: missing 'module <name>' line") };
        Ok(Self {name, declarations})
    }
}

fn parse_line(keyword: &str, rest: &str, name: &mut Option<String>, current: &mut Option<Declaration>, declarations: &mut HashMap<String, Declaration>) -> Result<()> {
    match keyword {
        "module" if name.is_none() && current.is_none() && !rest.is_empty() => *name = Some(rest.to_string()),
        "template" if current.is_none() => *current = Some(parse_template_header(rest)?),
        "struct" if current.is_none() => *current = Some(Declaration {name: parse_type_name(rest)?.canonical().to_string(), params: Vec::new(), fields: Vec::new(), typedefs: Vec::new()}),
        "field" | "typedef" => {
            let Some(d) = current.as_mut() else { return err!(Syntax, "'{}' outside of a declaration", keyword) };
            let Some((member, type_)) = rest.split_once(char::is_whitespace) else { return err!(Syntax, "expected '{} <name> <type>'", keyword) };
            let type_ = parse_type_name(type_.trim())?.canonical();
            if keyword == "field" {
                d.fields.push((member.to_string(), type_));
            } else {
                d.typedefs.push((member.to_string(), type_));
            }
        }
        "end" => {
            let Some(d) = current.take() else { return err!(Syntax, "'end' outside of a declaration") };
            if declarations.contains_key(&d.name) {
                return err!(Syntax, "duplicate declaration of {}", d.name);
            }
            declarations.insert(d.name.clone(), d);
        }
        _ => return err!(Syntax, "unexpected '{}'", keyword),
    }
    Ok(())
}

// "std::array<class T, size_t N>"
fn parse_template_header(s: &str) -> Result<Declaration> {
    let Some(open) = s.find('<') else { return err!(Syntax, "expected template parameter list in '{}'", s) };
    let Some(params_str) = s[open+1..].trim_end().strip_suffix('>') else { return err!(Syntax, "expected '>' at the end of '{}'", s) };
    let name = parse_type_name(s[..open].trim())?.canonical().to_string();
    let mut params: Vec<TemplateParam> = Vec::new();
    for p in params_str.split(',') {
        let words: Vec<&str> = p.split_whitespace().collect();
        let Some((&param_name, kind)) = words.split_last() else { return err!(Syntax, "empty template parameter in '{}'", s) };
        if kind.is_empty() {
            return err!(Syntax, "template parameter {} has no kind in '{}'", param_name, s);
        }
        let is_value = !(kind == ["class"] || kind == ["typename"]);
        params.push(TemplateParam {name: param_name.to_string(), is_value});
    }
    Ok(Declaration {name, params, fields: Vec::new(), typedefs: Vec::new()})
}

// Shipped with the debugger, used when no <module>.iface is found in the search path.
// Describes libc++'s layout.
pub const BUILTIN_STD_INTERFACE: &str = "
module std

template std::array<class T, size_t N>
  field __elems_ T[N]
  typedef value_type T
  typedef size_type unsigned long
  typedef difference_type long
  typedef reference T&
  typedef const_reference const T&
  typedef pointer T*
  typedef const_pointer const T*
  typedef iterator T*
  typedef const_iterator const T*
  typedef reverse_iterator std::reverse_iterator<T*>
  typedef const_reverse_iterator std::reverse_iterator<const T*>
end

template std::reverse_iterator<class Iter>
  field __t_ Iter
  field current Iter
  typedef iterator_type Iter
end

template std::pair<class T1, class T2>
  field first T1
  field second T2
  typedef first_type T1
  typedef second_type T2
end
";
