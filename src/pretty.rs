use crate::{*, types::*, error::*, expr::*, type_name::*};
use std::sync::Arc;

// Formatters present library types by their API rather than their implementation: std::array<int, 3> is shown as
// 3 elements, not as a struct with an `__elems_` member, and a.size(), a[1], a.begin() are evaluated by the
// debugger without running any code in the target.
//
// Dispatch is a table of rules matched against the type's canonical base name and template arity. A rule with exact
// arity beats a rule that accepts any arity; among equals, the first registered wins. Types no rule matches are
// formatted generically: struct members and C array elements as children, scalars by kind.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatterKind {
    Generic,
    FixedSizeArray,
}

#[derive(Clone, Debug)]
pub struct FormatterRule {
    pub family: String, // canonical qualified name without template arguments, e.g. "std::array"
    pub arity: Option<usize>, // None matches any number of template arguments
    pub kind: FormatterKind,
}

const BUILTIN_RULES: &[(&str, Option<usize>, FormatterKind)] = &[
    ("std::array", Some(2), FormatterKind::FixedSizeArray),
];

// Built once per session, read-only afterwards.
pub struct FormatterRegistry {
    rules: Vec<FormatterRule>,
}

impl FormatterRegistry {
    pub fn new() -> Self { Self {rules: Vec::new()} }

    pub fn with_builtin_rules() -> Self {
        let mut r = Self::new();
        for &(family, arity, kind) in BUILTIN_RULES {
            r.register(FormatterRule {family: family.to_string(), arity, kind});
        }
        r
    }

    pub fn register(&mut self, rule: FormatterRule) { self.rules.push(rule); }

    pub fn lookup(&self, t: &TypeDescriptor) -> FormatterKind {
        if t.t.as_struct().is_none() {
            return FormatterKind::Generic;
        }
        let expr = t.expr.canonical();
        let Some(base) = expr.base_name() else { return FormatterKind::Generic };
        let arity = expr.template_args().len();
        let mut any_arity: Option<FormatterKind> = None;
        for r in &self.rules {
            if r.family != base {
                continue;
            }
            match r.arity {
                Some(a) if a == arity => return r.kind,
                None if any_arity.is_none() => any_arity = Some(r.kind),
                _ => (),
            }
        }
        any_arity.unwrap_or(FormatterKind::Generic)
    }
}

impl FormatterKind {
    // Text shown next to the value: the scalar itself, or a short description of a container.
    pub fn summary(&self, v: &Value, context: &mut EvalContext) -> Result<Option<String>> {
        match self {
            Self::FixedSizeArray => Ok(Some(format!("size={}", FixedArray::of(v, context)?.len))),
            Self::Generic => match &v.type_.t {
                Type::Struct(_) | Type::Array {..} => Ok(None),
                _ => Ok(Some(format_scalar(v, context.memory)?)),
            }
        }
    }

    pub fn child_count(&self, v: &Value, context: &mut EvalContext) -> Result<usize> {
        match self {
            Self::FixedSizeArray => Ok(FixedArray::of(v, context)?.len),
            Self::Generic => Ok(match &v.type_.t {
                Type::Struct(s) => s.fields.len(),
                &Type::Array {len, ..} => len,
                _ => 0,
            }),
        }
    }

    // Doesn't read memory, only computes where the child is.
    pub fn child_at(&self, v: &Value, idx: usize, context: &mut EvalContext) -> Result<(/*name*/ String, Value)> {
        match self {
            Self::FixedSizeArray => Ok((format!("[{}]", idx), FixedArray::of(v, context)?.child_at(v, idx)?)),
            Self::Generic => match &v.type_.t {
                Type::Struct(s) => {
                    let Some(field) = s.fields.get(idx) else { return err!(NoSuchChild, "{} has no field #{}", v.type_.name, idx) };
                    let field_type = context.types.resolve(&field.type_name)?;
                    let val = get_struct_field(&v.val, field, &field_type)?;
                    Ok((field.name.clone(), Value::new(val, field_type)))
                }
                Type::Array {element, len} => {
                    if idx >= *len {
                        return err!(NoSuchChild, "index {} out of range for {}", idx, v.type_.name);
                    }
                    let element = context.types.resolve(element)?;
                    let val = get_element(&v.val, 0, idx, element.size)?;
                    Ok((format!("[{}]", idx), Value::new(val, element)))
                }
                _ => err!(NoSuchChild, "{} has no children", v.type_.name),
            }
        }
    }
}

// libc++, libstdc++ and MSVC all keep the elements in one C-array member. It's at offset 0 in practice, but we
// don't rely on that when the member is known.
const ELEMENT_STORAGE_FIELDS: &[&str] = &["__elems_", "_M_elems", "_Elems"];

// std::array<E, N> as seen through its API.
#[derive(Debug)]
pub struct FixedArray {
    pub element: Arc<TypeDescriptor>,
    pub len: usize,
    pub storage_offset: usize,
}

impl FixedArray {
    pub fn of(v: &Value, context: &mut EvalContext) -> Result<Self> {
        let t = &v.type_;
        let args = t.template_args();
        let (Some(TemplateArg::Type(e)), Some(&TemplateArg::Value(n))) = (args.get(0), args.get(1)) else { return err!(NotContainer, "{} is not a fixed-size array", t.name) };
        if n < 0 {
            return err!(NotContainer, "{} has negative length", t.name);
        }
        let len = n as usize;
        let element = context.types.resolve_expr(e)?;
        let storage_offset = t.fields().iter().find(|f| ELEMENT_STORAGE_FIELDS.contains(&f.name.as_str())).map_or(0, |f| f.offset);
        if len > 0 && element.size.checked_mul(len).and_then(|n| n.checked_add(storage_offset)).map_or(true, |end| end > t.size) {
            return err!(DescriptorConflict, "{} is {} bytes, too small for {} elements of {} bytes", t.name, t.size, len, element.size);
        }
        Ok(Self {element, len, storage_offset})
    }

    pub fn child_at(&self, v: &Value, idx: usize) -> Result<Value> {
        if idx >= self.len {
            return err!(NoSuchChild, "index {} out of range for {} (size {})", idx, v.type_.display_name(), self.len);
        }
        Ok(Value::new(get_element(&v.val, self.storage_offset, idx, self.element.size)?, self.element.clone()))
    }

    // at(i) and operator[]. Both are bounds-checked here: an out-of-range read through a debugger would be garbage anyway.
    pub fn index(&self, v: &Value, idx: i64) -> Result<Value> {
        if idx < 0 {
            return err!(NoSuchChild, "index {} out of range for {} (size {})", idx, v.type_.display_name(), self.len);
        }
        Ok(self.child_at(v, idx as usize)?.with_alias("value_type"))
    }

    pub fn front(&self, v: &Value) -> Result<Value> {
        if self.len == 0 {
            return err!(EmptyContainer, "front() of empty {}", v.type_.display_name());
        }
        Ok(self.child_at(v, 0)?.with_alias("value_type"))
    }

    pub fn back(&self, v: &Value) -> Result<Value> {
        if self.len == 0 {
            return err!(EmptyContainer, "back() of empty {}", v.type_.display_name());
        }
        Ok(self.child_at(v, self.len - 1)?.with_alias("value_type"))
    }

    pub fn size(&self, context: &mut EvalContext) -> Result<Value> {
        Ok(Value::immediate(self.len, context.types.resolve("unsigned long")?).with_alias("size_type"))
    }

    pub fn empty(&self, context: &mut EvalContext) -> Result<Value> {
        Ok(Value::immediate((self.len == 0) as usize, context.types.resolve("bool")?))
    }

    pub fn data(&self, v: &Value) -> Result<Value> {
        let (base, _) = self.elements_range(v, "data()")?;
        Ok(Value::immediate(base, Arc::new(pointer_descriptor(&self.element.expr))).with_alias("pointer"))
    }

    fn elements_range(&self, v: &Value, what: &str) -> Result<(usize, std::ops::Range<usize>)> {
        let Some(addr) = v.addr() else { return err!(NotImplemented, "{} of {} that is not in memory", what, v.type_.display_name()) };
        let base = addr + self.storage_offset;
        Ok((base, base..base + self.len * self.element.size))
    }

    // Forward iterators point at their element. Reverse iterators here also point at their element (not one past it,
    // as std::reverse_iterator stores it), so rbegin() is the address of the last element.
    pub fn begin(&self, v: &Value) -> Result<Value> {
        let (base, range) = self.elements_range(v, "begin()")?;
        Ok(make_iterator(Arc::new(iterator_descriptor(&self.element, false)), base, range).with_alias("iterator"))
    }

    pub fn end(&self, v: &Value) -> Result<Value> {
        let (_, range) = self.elements_range(v, "end()")?;
        Ok(make_iterator(Arc::new(iterator_descriptor(&self.element, false)), range.end, range).with_alias("iterator"))
    }

    pub fn rbegin(&self, v: &Value) -> Result<Value> {
        let (_, range) = self.elements_range(v, "rbegin()")?;
        let addr = range.end.wrapping_sub(self.element.size);
        Ok(make_iterator(Arc::new(iterator_descriptor(&self.element, true)), addr, range).with_alias("reverse_iterator"))
    }

    pub fn rend(&self, v: &Value) -> Result<Value> {
        let (base, range) = self.elements_range(v, "rend()")?;
        Ok(make_iterator(Arc::new(iterator_descriptor(&self.element, true)), base.wrapping_sub(self.element.size), range).with_alias("reverse_iterator"))
    }
}

// Container methods the debugger evaluates itself. Returns None if the method isn't one of them, then the caller may
// run the real method in the target.
pub fn call_container_method(v: &Value, method: &str, args: &[Value], context: &mut EvalContext) -> Result<Option<Value>> {
    match context.formatters.lookup(&v.type_) {
        FormatterKind::FixedSizeArray => (),
        FormatterKind::Generic => return Ok(None),
    }
    let a = FixedArray::of(v, context)?;
    let expect_args = |n: usize| -> Result<()> {
        if args.len() != n {
            return err!(TypeMismatch, "{}() takes {} argument{}, got {}", method, n, if n == 1 {""} else {"s"}, args.len());
        }
        Ok(())
    };
    Ok(Some(match method {
        "size" | "max_size" => { expect_args(0)?; a.size(context)? }
        "empty" => { expect_args(0)?; a.empty(context)? }
        "front" => { expect_args(0)?; a.front(v)? }
        "back" => { expect_args(0)?; a.back(v)? }
        "at" => {
            expect_args(1)?;
            let idx = read_integer(&args[0], context.memory, "index")?;
            a.index(v, idx)?
        }
        "data" => { expect_args(0)?; a.data(v)? }
        "begin" | "cbegin" => { expect_args(0)?; a.begin(v)? }
        "end" | "cend" => { expect_args(0)?; a.end(v)? }
        "rbegin" | "crbegin" => { expect_args(0)?; a.rbegin(v)? }
        "rend" | "crend" => { expect_args(0)?; a.rend(v)? }
        _ => return Ok(None),
    }))
}

// v[idx]
pub fn index_value(v: &Value, idx: i64, context: &mut EvalContext) -> Result<Value> {
    match (context.formatters.lookup(&v.type_), &v.type_.t) {
        (FormatterKind::FixedSizeArray, _) => FixedArray::of(v, context)?.index(v, idx),
        (FormatterKind::Generic, Type::Array {len, ..}) => {
            if idx < 0 || idx as usize >= *len {
                return err!(NoSuchChild, "index {} out of range for {}", idx, v.type_.name);
            }
            Ok(FormatterKind::Generic.child_at(v, idx as usize, context)?.1)
        }
        (FormatterKind::Generic, Type::Pointer(pointee)) => {
            let pointee = context.types.resolve(pointee)?;
            let addr = read_address(v, context.memory)?;
            Ok(Value::at_addr(addr.wrapping_add((idx as usize).wrapping_mul(pointee.size)), pointee))
        }
        _ => err!(NotContainer, "{} can't be indexed", v.type_.display_name()),
    }
}

// *it
pub fn deref_iterator(v: &Value, context: &mut EvalContext) -> Result<Value> {
    let Some(it) = v.type_.t.as_iterator() else { return err!(TypeMismatch, "{} is not an iterator", v.type_.name) };
    let (addr, range) = iterator_parts(v)?;
    if !range.contains(&addr) {
        return err!(NoSuchChild, "iterator 0x{:x} doesn't point to an element (elements are at 0x{:x}..0x{:x})", addr, range.start, range.end);
    }
    if it.stride != 0 && (addr - range.start) % it.stride != 0 {
        return err!(Sanity, "misaligned iterator 0x{:x}", addr);
    }
    let element = context.types.resolve(&it.element)?;
    let r = Value::at_addr(addr, element);
    // Forward iterators of std::array are plain pointers to value_type; reverse_iterator::operator* returns `reference`,
    // which is shown as the element type.
    Ok(if it.reverse {r} else {r.with_alias("value_type")})
}

// it + k, it - k
pub fn advance_iterator(v: &Value, k: i64) -> Result<Value> {
    let Some(it) = v.type_.t.as_iterator() else { return err!(TypeMismatch, "{} is not an iterator", v.type_.name) };
    let (addr, range) = iterator_parts(v)?;
    let Some(delta) = k.checked_mul(it.stride as i64) else { return err!(Runtime, "iterator offset overflow") };
    let delta = if it.reverse {delta.wrapping_neg()} else {delta};
    let mut r = make_iterator(v.type_.clone(), addr.wrapping_add(delta as usize), range);
    r.alias = v.alias.clone();
    Ok(r)
}
