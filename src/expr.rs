use crate::{*, error::*, types::*, memory::*, resolver::*, pretty::*};
use std::{ops::Range, sync::Arc};
use bitflags::*;

// Just a byte array that avoids heap allocation if length is <= 24 bytes.
// Doesn't store an exact length. The length is usually determined by data type, stored separately.
// Most of the time used for storing 8-byte values, e.g. integers returned by container methods, so this case needs to be fast.
#[derive(Debug, Clone)]
pub enum ValueBlob {
    Small([usize; 3]),
    Big(Vec<u8>),
}

impl ValueBlob {
    pub fn new(v: usize) -> Self { Self::Small([v, 0, 0]) }

    pub fn from_three_usizes(a: [usize; 3]) -> Self { Self::Small(a) }

    pub fn from_vec(v: Vec<u8>) -> Self {
        if v.len() <= 24 {
            Self::from_slice(&v)
        } else {
            Self::Big(v)
        }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        if bytes <= 24 {
            Self::Small([0; 3])
        } else {
            Self::Big(vec![0; bytes])
        }
    }

    pub fn from_slice(s: &[u8]) -> Self {
        let mut r = Self::with_capacity(s.len());
        r.as_mut_slice()[..s.len()].copy_from_slice(s);
        r
    }

    pub fn as_slice(&self) -> &[u8] { match self { Self::Small(a) => unsafe {std::slice::from_raw_parts(a.as_ptr() as *const u8, 24)}, Self::Big(v) => v.as_slice() } }
    pub fn as_mut_slice(&mut self) -> &mut [u8] { match self { Self::Small(a) => unsafe {std::slice::from_raw_parts_mut(a.as_mut_ptr() as *mut u8, 24)}, Self::Big(v) => v.as_mut_slice() } }

    pub fn capacity(&self) -> usize { match self { Self::Small(_) => 24, Self::Big(v) => v.len() } }

    pub fn get_usize_prefix(&self) -> usize {
        match self {
            Self::Small(a) => a[0],
            Self::Big(v) => {
                let mut a: [u8; 8] = [0; 8];
                let n = v.len().min(8);
                a[..n].copy_from_slice(&v[..n]);
                usize::from_le_bytes(a)
            }
        }
    }

    pub fn get_usize_at(&self, offset: usize) -> Result<usize> {
        let s = self.as_slice();
        if offset + 8 > s.len() {
            return err!(Internal, "blob offset out of bounds: {}+8 > {}", offset, s.len());
        }
        let mut a = [0u8; 8];
        a.copy_from_slice(&s[offset..offset+8]);
        Ok(usize::from_le_bytes(a))
    }

    pub fn slice(&self, r: Range<usize>) -> Result<Self> {
        let s = self.as_slice();
        if r.start > r.end || r.end > s.len() {
            return err!(Sanity, "value range {}..{} out of bounds ({} bytes)", r.start, r.end, s.len());
        }
        Ok(Self::from_slice(&s[r]))
    }
}

// For values whose address is known, we defer reading memory until the value is actually displayed or used.
// E.g. a.front() only computes an address; a[1000000] on a big array never reads the other elements.
#[derive(Debug, Clone)]
pub enum AddrOrValueBlob {
    Addr(usize),
    Blob(ValueBlob),
}
impl Default for AddrOrValueBlob { fn default() -> Self { AddrOrValueBlob::Blob(ValueBlob::new(0)) } }

impl AddrOrValueBlob {
    pub fn into_value(self, bytes: usize, memory: &mut dyn TargetMemory) -> Result<ValueBlob> {
        Ok(match self {
            Self::Blob(b) => {
                if b.capacity() < bytes {
                    return err!(Sanity, "value too short: ~{} < {}", b.capacity(), bytes);
                }
                b
            }
            Self::Addr(a) => {
                let mut b = ValueBlob::with_capacity(bytes);
                memory.read(a, &mut b.as_mut_slice()[..bytes])?;
                b
            }
        })
    }

    pub fn addr(&self) -> Option<usize> { match self { Self::Addr(a) => Some(*a), _ => None } }
}

bitflags! { pub struct ValueFlags: u8 {
    // Iterator that doesn't point at an element, e.g. end(), or begin() of an empty array.
    const NOT_DEREFERENCEABLE = 0x1;
}}

#[derive(Clone, Debug)]
pub struct Value {
    // We don't pre-check that val's blob capacity >= type_.size. It's up to the consumer of Value to check this when needed.
    pub val: AddrOrValueBlob,
    pub type_: Arc<TypeDescriptor>,
    // The member typedef name through which the value was returned, e.g. "value_type" for a.front().
    pub alias: Option<String>,
    pub flags: ValueFlags,
}

impl Value {
    pub fn new(val: AddrOrValueBlob, type_: Arc<TypeDescriptor>) -> Self { Self {val, type_, alias: None, flags: ValueFlags::empty()} }
    pub fn at_addr(addr: usize, type_: Arc<TypeDescriptor>) -> Self { Self::new(AddrOrValueBlob::Addr(addr), type_) }
    pub fn immediate(x: usize, type_: Arc<TypeDescriptor>) -> Self { Self::new(AddrOrValueBlob::Blob(ValueBlob::new(x)), type_) }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn addr(&self) -> Option<usize> { self.val.addr() }
}

// Iterators are addresses. We additionally remember the element range of the container they came from, to tell
// whether dereferencing is valid. Blob layout: [address, begin, end].
pub fn make_iterator(type_: Arc<TypeDescriptor>, addr: usize, elements: Range<usize>) -> Value {
    let mut v = Value::new(AddrOrValueBlob::Blob(ValueBlob::from_three_usizes([addr, elements.start, elements.end])), type_);
    if !elements.contains(&addr) {
        v.flags.insert(ValueFlags::NOT_DEREFERENCEABLE);
    }
    v
}

pub fn iterator_parts(v: &Value) -> Result<(usize, Range<usize>)> {
    match &v.val {
        AddrOrValueBlob::Blob(b) => Ok((b.get_usize_at(0)?, b.get_usize_at(8)?..b.get_usize_at(16)?)),
        AddrOrValueBlob::Addr(_) => err!(Internal, "iterator value in memory"),
    }
}

// Debugger-side things like literals and sizes are immediate values; things in the target's memory are addresses.
pub fn get_struct_field(val: &AddrOrValueBlob, field: &StructField, field_type: &TypeDescriptor) -> Result<AddrOrValueBlob> {
    Ok(match val {
        AddrOrValueBlob::Addr(addr) => AddrOrValueBlob::Addr(addr + field.offset),
        AddrOrValueBlob::Blob(blob) => match blob.slice(field.offset..field.offset + field_type.size) {
            Ok(b) => AddrOrValueBlob::Blob(b),
            Err(_) => return err!(Sanity, "field {} out of bounds: {}+{} vs {}", field.name, field.offset, field_type.size, blob.capacity()),
        }
    })
}

// Element `idx` of a contiguous sequence starting at `offset` within `val`.
pub fn get_element(val: &AddrOrValueBlob, offset: usize, idx: usize, element_size: usize) -> Result<AddrOrValueBlob> {
    let start = offset + idx * element_size;
    Ok(match val {
        AddrOrValueBlob::Addr(addr) => AddrOrValueBlob::Addr(addr + start),
        AddrOrValueBlob::Blob(blob) => AddrOrValueBlob::Blob(blob.slice(start..start + element_size)?),
    })
}

pub fn read_integer(v: &Value, memory: &mut dyn TargetMemory, what: &str) -> Result<i64> {
    let t = &v.type_;
    let Some(p) = t.t.as_primitive() else { return err!(TypeMismatch, "{} must be an integer, got {}", what, t.name) };
    if !t.t.is_integer() || t.size > 8 {
        return err!(TypeMismatch, "{} must be an integer, got {}", what, t.name);
    }
    let blob = v.val.clone().into_value(t.size, memory)?;
    let mut a = [0u8; 8];
    a[..t.size].copy_from_slice(&blob.as_slice()[..t.size]);
    let x = u64::from_le_bytes(a);
    Ok(if p.contains(PrimitiveFlags::SIGNED) && t.size < 8 && t.size > 0 {
        let shift = 64 - t.size * 8;
        ((x << shift) as i64) >> shift
    } else {
        x as i64
    })
}

// Value of a pointer or iterator.
pub fn read_address(v: &Value, memory: &mut dyn TargetMemory) -> Result<usize> {
    match &v.type_.t {
        Type::Iterator(_) => Ok(iterator_parts(v)?.0),
        Type::Pointer(_) => Ok(v.val.clone().into_value(8, memory)?.get_usize_prefix()),
        _ => err!(TypeMismatch, "expected pointer or iterator, got {}", v.type_.name),
    }
}

pub fn format_scalar(v: &Value, memory: &mut dyn TargetMemory) -> Result<String> {
    let t = &v.type_;
    match &t.t {
        Type::Primitive(p) if p.contains(PrimitiveFlags::UNSPECIFIED) => Ok("void".to_string()),
        Type::Primitive(p) if p.contains(PrimitiveFlags::BOOL) => Ok(if read_integer(v, memory, "bool")? != 0 {"true"} else {"false"}.to_string()),
        Type::Primitive(p) if p.contains(PrimitiveFlags::FLOAT) => {
            let blob = v.val.clone().into_value(t.size, memory)?;
            match t.size {
                4 => Ok(format!("{}", f32::from_bits(blob.get_usize_prefix() as u32))),
                8 => Ok(format!("{}", f64::from_bits(blob.get_usize_prefix() as u64))),
                _ => Ok(format!("<{}-byte float>", t.size)),
            }
        }
        Type::Primitive(p) => {
            let x = read_integer(v, memory, "value")?;
            if p.contains(PrimitiveFlags::CHAR) && t.size == 1 && (0x20..0x7f).contains(&x) {
                Ok(format!("{} '{}'", x, x as u8 as char))
            } else if p.contains(PrimitiveFlags::SIGNED) {
                Ok(format!("{}", x))
            } else {
                Ok(format!("{}", x as u64))
            }
        }
        Type::Pointer(_) => Ok(format!("0x{:x}", read_address(v, memory)?)),
        Type::Iterator(_) => {
            let (addr, _) = iterator_parts(v)?;
            if v.flags.contains(ValueFlags::NOT_DEREFERENCEABLE) {
                Ok(format!("0x{:x} (not dereferenceable)", addr))
            } else {
                Ok(format!("0x{:x}", addr))
            }
        }
        Type::Unknown => Ok("<unknown type>".to_string()),
        Type::Array {..} | Type::Struct(_) => err!(Internal, "{} is not a scalar", t.name),
    }
}

// Information needed for evaluating and formatting values of one request.
pub struct EvalContext<'a, 'b> {
    pub memory: &'b mut dyn TargetMemory,
    pub types: &'b mut ResolveScope<'a>,
    pub formatters: &'b FormatterRegistry,
}

// Result of evaluating an expression, as shown to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedValue {
    pub name: String,
    pub type_name: String,
    pub alias: Option<String>,
    // Scalar value, or a summary for containers (e.g. "size=3").
    pub value: Option<String>,
    pub children: Vec<RenderedValue>,
    // Some children were omitted because of render limits.
    pub truncated: bool,
}

impl RenderedValue {
    pub fn child(&self, name: &str) -> Option<&RenderedValue> { self.children.iter().find(|c| c.name == name) }

    // Type as shown to the user: the alias if there is one, e.g. "value_type".
    pub fn shown_type(&self) -> &str { self.alias.as_ref().unwrap_or(&self.type_name) }
}

#[derive(Clone, Copy, Debug)]
pub struct RenderLimits {
    pub max_children: usize,
    pub max_depth: usize,
}

// Builds the value tree. Children are produced one by one by the formatter, up to the limits; only memory of
// rendered scalars is read.
pub fn render_value(name: String, v: &Value, limits: &RenderLimits, depth: usize, context: &mut EvalContext) -> Result<RenderedValue> {
    let formatter = context.formatters.lookup(&v.type_);
    let mut r = RenderedValue {name, type_name: v.type_.display_name(), alias: v.alias.clone(), value: formatter.summary(v, context)?, children: Vec::new(), truncated: false};
    let count = formatter.child_count(v, context)?;
    if count == 0 {
        return Ok(r);
    }
    if depth >= limits.max_depth {
        r.truncated = true;
        return Ok(r);
    }
    let shown = count.min(limits.max_children);
    for i in 0..shown {
        let (child_name, child) = formatter.child_at(v, i, context)?;
        r.children.push(render_value(child_name, &child, limits, depth + 1, context)?);
    }
    r.truncated = shown < count;
    Ok(r)
}

#[cfg(test)]
mod tests {
    use crate::{expr::*, test_util::*};

    #[test]
    fn blob_slicing() {
        let b = ValueBlob::from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(&b.slice(1..3).unwrap().as_slice()[..2], &[2, 3]);
        assert!(b.slice(20..30).is_err());
        let big = ValueBlob::from_vec((0..40).collect());
        assert_eq!(big.capacity(), 40);
        assert_eq!(big.get_usize_at(8).unwrap(), usize::from_le_bytes([8, 9, 10, 11, 12, 13, 14, 15]));
        assert_eq!(ValueBlob::new(7).get_usize_prefix(), 7);
    }

    #[test]
    fn scalars() {
        let mut mem = FakeMemory::new();
        mem.map(0x1000, &(-5i32).to_le_bytes());
        mem.map(0x2000, &1.5f64.to_le_bytes());
        let int = Arc::new(builtin_primitive("int").unwrap());
        let v = Value::at_addr(0x1000, int.clone());
        assert_eq!(read_integer(&v, &mut mem, "x").unwrap(), -5);
        assert_eq!(format_scalar(&v, &mut mem).unwrap(), "-5");
        let u = Value::at_addr(0x1000, Arc::new(builtin_primitive("unsigned int").unwrap()));
        assert_eq!(format_scalar(&u, &mut mem).unwrap(), "4294967291");
        let d = Value::at_addr(0x2000, Arc::new(builtin_primitive("double").unwrap()));
        assert_eq!(format_scalar(&d, &mut mem).unwrap(), "1.5");
        assert!(read_integer(&d, &mut mem, "index").unwrap_err().is_type_mismatch());
        let c = Value::immediate(b'a' as usize, Arc::new(builtin_primitive("char").unwrap()));
        assert_eq!(format_scalar(&c, &mut mem).unwrap(), "97 'a'");
        let b = Value::immediate(1, Arc::new(builtin_primitive("bool").unwrap()));
        assert_eq!(format_scalar(&b, &mut mem).unwrap(), "true");
        assert!(format_scalar(&Value::at_addr(0x5000, int), &mut mem).unwrap_err().is_unmapped_memory());
    }

    #[test]
    fn iterators_know_their_range() {
        let int = builtin_primitive("int").unwrap();
        let t = Arc::new(iterator_descriptor(&int, false));
        let it = make_iterator(t.clone(), 0x1008, 0x1000..0x100c);
        assert!(!it.flags.contains(ValueFlags::NOT_DEREFERENCEABLE));
        assert_eq!(iterator_parts(&it).unwrap(), (0x1008, 0x1000..0x100c));
        let end = make_iterator(t, 0x100c, 0x1000..0x100c);
        assert!(end.flags.contains(ValueFlags::NOT_DEREFERENCEABLE));
        assert_eq!(format_scalar(&end, &mut FakeMemory::new()).unwrap(), "0x100c (not dereferenceable)");
    }

    #[test]
    fn struct_fields_of_immediate_values() {
        let int = builtin_primitive("int").unwrap();
        let blob = AddrOrValueBlob::Blob(ValueBlob::from_slice(&[1, 0, 0, 0, 2, 0, 0, 0]));
        let f = StructField {name: "y".to_string(), offset: 4, type_name: "int".to_string()};
        let v = Value::new(get_struct_field(&blob, &f, &int).unwrap(), Arc::new(int.clone()));
        assert_eq!(read_integer(&v, &mut FakeMemory::new(), "y").unwrap(), 2);
        assert_eq!(get_struct_field(&AddrOrValueBlob::Addr(0x100), &f, &int).unwrap().addr(), Some(0x104));
        assert_eq!(get_element(&AddrOrValueBlob::Addr(0x100), 0, 3, 4).unwrap().addr(), Some(0x10c));
    }
}
