use crate::{*, error::*, type_name::*};
use std::fmt;
use bitflags::*;
use gimli::DebugInfoOffset;

// Resolved types. A TypeDescriptor is immutable once built and is shared as Arc<TypeDescriptor>
// (the resolver memoizes them per session).
// Unlike debug info, descriptors refer to other types by name, not by pointer: member and element types are resolved
// on demand, each through whichever path works for it (debug info or module import). This keeps the graph acyclic
// and lets e.g. std::array<DbgInfo, 1> come from a module interface while DbgInfo comes from debug info.

bitflags! { pub struct PrimitiveFlags: u8 {
    const SIGNED = 0x1;
    const FLOAT = 0x2;
    const CHAR = 0x4;
    const BOOL = 0x10;
    const UNSPECIFIED = 0x20; // void

    const SIGNED_CHAR = Self::CHAR.bits | Self::SIGNED.bits;
}}

bitflags! { pub struct TypeFlags: u8 {
    // The debug info had a declaration but no definition.
    const DECLARATION = 0x1;
    // The debug info knows the size but not the members (e.g. the compiler emitted the type as a byte blob).
    const OPAQUE = 0x2;
    const SIZE_KNOWN = 0x8;
    const BUILTIN = 0x10;
    // Members or nested typedefs came from a module interface rather than debug info.
    const IMPORT_FILLED = 0x20;
    // Made up by the debugger, e.g. iterator types returned by container formatters.
    const SYNTHESIZED = 0x40;
}}

// DIE offsets at or above this are debugger builtins, not real DWARF.
pub const FAKE_DWARF_OFFSET_START: usize = (1 << 48) - 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructField {
    pub name: String,
    pub offset: usize, // bytes
    pub type_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StructType {
    pub fields: Vec<StructField>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IteratorType {
    pub element: String,
    pub stride: usize,
    // Advancing a reverse iterator moves to lower addresses.
    pub reverse: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Unknown,
    Primitive(PrimitiveFlags),
    Pointer(String), // pointee type name
    Array {element: String, len: usize}, // C array
    Struct(StructType),
    Iterator(IteratorType),
}
impl Type {
    pub fn as_primitive(&self) -> Option<PrimitiveFlags> { match self { &Type::Primitive(f) => Some(f), _ => None } }
    pub fn as_struct(&self) -> Option<&StructType> { match self { Type::Struct(s) => Some(s), _ => None } }
    pub fn as_iterator(&self) -> Option<&IteratorType> { match self { Type::Iterator(i) => Some(i), _ => None } }
    pub fn is_integer(&self) -> bool { match self { Type::Primitive(p) => !p.intersects(PrimitiveFlags::FLOAT | PrimitiveFlags::UNSPECIFIED), _ => false } }
    pub fn kind_name(&self) -> &'static str {
        match self {
            Type::Unknown => "unknown",
            Type::Primitive(_) => "primitive type",
            Type::Pointer(_) => "pointer",
            Type::Array {..} => "array",
            Type::Struct(_) => "struct",
            Type::Iterator(i) if i.reverse => "reverse iterator",
            Type::Iterator(_) => "iterator",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completeness {
    DebugInfo,
    ImportFilled,
}

#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    // Name to display, e.g. "std::array<int, 3>". Keeps inline namespaces if debug info had them.
    pub name: String,
    pub expr: TypeExpr,
    pub size: usize,
    pub align: usize,
    pub die: DebugInfoOffset, // 0 means not from DWARF
    pub flags: TypeFlags,
    // Typedefs inside the type, e.g. value_type -> int.
    pub nested_types: Vec<(String, String)>,
    pub t: Type,
}

impl TypeDescriptor {
    pub fn new(expr: TypeExpr, t: Type, size: usize, align: usize) -> Self {
        Self {name: expr.to_string(), expr, size, align, die: DebugInfoOffset(0), flags: TypeFlags::SIZE_KNOWN, nested_types: Vec::new(), t}
    }

    // Without inline namespaces: "std::array<int, 3>" rather than "std::__1::array<int, 3>".
    pub fn display_name(&self) -> String { self.expr.canonical().to_string() }
    pub fn template_args(&self) -> &[TemplateArg] { self.expr.template_args() }
    pub fn fields(&self) -> &[StructField] { match &self.t { Type::Struct(s) => &s.fields, _ => &[] } }
    pub fn field(&self, name: &str) -> Option<&StructField> { self.fields().iter().find(|f| f.name == name) }
    pub fn nested_type(&self, name: &str) -> Option<&str> { self.nested_types.iter().find(|(n, _)| n == name).map(|(_, t)| t.as_str()) }

    // Usable for laying out values: size and members are known.
    pub fn is_complete(&self) -> bool { !self.flags.intersects(TypeFlags::DECLARATION | TypeFlags::OPAQUE) && self.flags.contains(TypeFlags::SIZE_KNOWN) }
    pub fn completeness(&self) -> Completeness { if self.flags.contains(TypeFlags::IMPORT_FILLED) {Completeness::ImportFilled} else {Completeness::DebugInfo} }
    pub fn is_builtin(&self) -> bool { self.flags.contains(TypeFlags::BUILTIN) }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        (&self.name, self.size, self.align, self.flags, &self.nested_types, &self.t) == (&other.name, other.size, other.align, other.flags, &other.nested_types, &other.t)
    }
}

// For printing to log.
impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}, {} bytes", self.name, self.t.kind_name(), self.size)?;
        if self.flags.contains(TypeFlags::IMPORT_FILLED) {
            write!(f, ", import-filled")?;
        }
        if !self.is_complete() {
            write!(f, ", incomplete")?;
        }
        write!(f, ")")
    }
}

// C/C++ builtin types, assuming LP64.
const PRIMITIVES: &[(&str, usize, PrimitiveFlags)] = &[
    ("void", 0, PrimitiveFlags::UNSPECIFIED),
    ("bool", 1, PrimitiveFlags::BOOL),
    ("char", 1, PrimitiveFlags::SIGNED_CHAR),
    ("signed char", 1, PrimitiveFlags::SIGNED),
    ("unsigned char", 1, PrimitiveFlags::empty()),
    ("char8_t", 1, PrimitiveFlags::CHAR),
    ("char16_t", 2, PrimitiveFlags::CHAR),
    ("char32_t", 4, PrimitiveFlags::CHAR),
    ("wchar_t", 4, PrimitiveFlags::SIGNED_CHAR),
    ("short", 2, PrimitiveFlags::SIGNED),
    ("short int", 2, PrimitiveFlags::SIGNED),
    ("unsigned short", 2, PrimitiveFlags::empty()),
    ("int", 4, PrimitiveFlags::SIGNED),
    ("signed", 4, PrimitiveFlags::SIGNED),
    ("signed int", 4, PrimitiveFlags::SIGNED),
    ("unsigned", 4, PrimitiveFlags::empty()),
    ("unsigned int", 4, PrimitiveFlags::empty()),
    ("long", 8, PrimitiveFlags::SIGNED),
    ("long int", 8, PrimitiveFlags::SIGNED),
    ("unsigned long", 8, PrimitiveFlags::empty()),
    ("long long", 8, PrimitiveFlags::SIGNED),
    ("unsigned long long", 8, PrimitiveFlags::empty()),
    ("size_t", 8, PrimitiveFlags::empty()),
    ("ssize_t", 8, PrimitiveFlags::SIGNED),
    ("ptrdiff_t", 8, PrimitiveFlags::SIGNED),
    ("int8_t", 1, PrimitiveFlags::SIGNED),
    ("int16_t", 2, PrimitiveFlags::SIGNED),
    ("int32_t", 4, PrimitiveFlags::SIGNED),
    ("int64_t", 8, PrimitiveFlags::SIGNED),
    ("uint8_t", 1, PrimitiveFlags::empty()),
    ("uint16_t", 2, PrimitiveFlags::empty()),
    ("uint32_t", 4, PrimitiveFlags::empty()),
    ("uint64_t", 8, PrimitiveFlags::empty()),
    ("float", 4, PrimitiveFlags::FLOAT),
    ("double", 8, PrimitiveFlags::FLOAT),
    ("long double", 16, PrimitiveFlags::FLOAT),
];

pub fn builtin_primitive(name: &str) -> Option<TypeDescriptor> {
    let name = name.strip_prefix("std::").unwrap_or(name);
    let idx = PRIMITIVES.iter().position(|(n, _, _)| *n == name)?;
    let (n, size, flags) = PRIMITIVES[idx];
    let mut t = TypeDescriptor::new(TypeExpr::named(n), Type::Primitive(flags), size, size.max(1));
    t.flags.insert(TypeFlags::BUILTIN);
    t.die = DebugInfoOffset(FAKE_DWARF_OFFSET_START + idx);
    Some(t)
}

pub fn pointer_descriptor(pointee: &TypeExpr) -> TypeDescriptor {
    let mut t = TypeDescriptor::new(TypeExpr::Pointer(Box::new(pointee.clone())), Type::Pointer(pointee.to_string()), 8, 8);
    t.flags.insert(TypeFlags::BUILTIN);
    t
}

pub fn array_descriptor(element: &TypeDescriptor, len: usize) -> Result<TypeDescriptor> {
    let Some(size) = element.size.checked_mul(len) else { return err!(TooLong, "{}[{}] is too big", element.name, len) };
    let mut t = TypeDescriptor::new(TypeExpr::Array(Box::new(element.expr.clone()), len), Type::Array {element: element.name.clone(), len}, size, element.align);
    t.flags.insert(TypeFlags::BUILTIN);
    Ok(t)
}

// libc++ std::array<T, N>::iterator is T*, reverse_iterator is std::reverse_iterator<T*>.
// Both are represented as a plain address; only the advance direction differs.
pub fn iterator_descriptor(element: &TypeDescriptor, reverse: bool) -> TypeDescriptor {
    let pointer = TypeExpr::Pointer(Box::new(element.expr.clone()));
    let expr = if reverse {
        TypeExpr::Named {base: "std::reverse_iterator".to_string(), args: vec![TemplateArg::Type(pointer)]}
    } else {
        pointer
    };
    let mut t = TypeDescriptor::new(expr, Type::Iterator(IteratorType {element: element.name.clone(), stride: element.size, reverse}), 8, 8);
    t.flags.insert(TypeFlags::SYNTHESIZED);
    t
}

pub fn align_up(x: usize, align: usize) -> Option<usize> {
    let align = align.max(1);
    Some(x.checked_add(align - 1)? / align * align)
}

// Sequential C layout. Returns fields with offsets, total size, and alignment.
// Size is never 0, as in C++.
pub fn layout_struct_fields(members: &[(String, &TypeDescriptor)]) -> Result<(Vec<StructField>, usize, usize)> {
    let mut fields: Vec<StructField> = Vec::new();
    let (mut offset, mut align) = (0usize, 1usize);
    for (name, t) in members {
        let end = align_up(offset, t.align).and_then(|o| Some((o, o.checked_add(t.size)?)));
        let Some((start, end)) = end else { return err!(TooLong, "struct is too big: member {} ({} bytes) doesn't fit after offset {}", name, t.size, offset) };
        align = align.max(t.align);
        fields.push(StructField {name: name.clone(), offset: start, type_name: t.name.clone()});
        offset = end;
    }
    let Some(size) = align_up(offset.max(1), align) else { return err!(TooLong, "struct is too big: {} bytes", offset) };
    Ok((fields, size, align))
}

// Debug info usually doesn't tell alignment. Guess it from members or size.
pub fn guess_alignment(size: usize) -> usize {
    match size {
        0 | 1 => 1,
        2 | 3 => 2,
        4..=7 => 4,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use crate::types::*;

    #[test]
    fn primitives() {
        let t = builtin_primitive("unsigned long").unwrap();
        assert_eq!((t.size, t.align, t.t.is_integer()), (8, 8, true));
        assert!(t.is_builtin() && t.is_complete());
        assert_eq!(builtin_primitive("std::size_t").unwrap().name, "size_t");
        assert!(builtin_primitive("DbgInfo").is_none());
        assert!(!builtin_primitive("double").unwrap().t.is_integer());
        assert_eq!(builtin_primitive("void").unwrap().align, 1);
    }

    #[test]
    fn struct_layout_pads_and_aligns() {
        let c = builtin_primitive("char").unwrap();
        let i = builtin_primitive("int").unwrap();
        let l = builtin_primitive("long").unwrap();
        let (fields, size, align) = layout_struct_fields(&[("a".to_string(), &c), ("b".to_string(), &i), ("c".to_string(), &c), ("d".to_string(), &l)]).unwrap();
        assert_eq!(fields.iter().map(|f| f.offset).collect::<Vec<_>>(), vec![0, 4, 8, 16]);
        assert_eq!((size, align), (24, 8));

        let (fields, size, align) = layout_struct_fields(&[]).unwrap();
        assert!(fields.is_empty());
        assert_eq!((size, align), (1, 1));

        let arr0 = array_descriptor(&i, 0).unwrap();
        let (_, size, align) = layout_struct_fields(&[("__elems_".to_string(), &arr0)]).unwrap();
        assert_eq!((size, align), (4, 4));
    }

    #[test]
    fn huge_sizes_are_errors() {
        let l = builtin_primitive("long").unwrap();
        assert_eq!(array_descriptor(&l, 1 << 62).unwrap_err().code(), Some(ErrorCode::TooLong));
        let big = array_descriptor(&l, (1 << 60) - 1).unwrap();
        assert_eq!(big.size, usize::MAX - 7);
        let c = builtin_primitive("char").unwrap();
        assert_eq!(layout_struct_fields(&[("a".to_string(), &c), ("b".to_string(), &big)]).unwrap_err().code(), Some(ErrorCode::TooLong));
        assert_eq!(layout_struct_fields(&[("b".to_string(), &big), ("a".to_string(), &c)]).unwrap_err().code(), Some(ErrorCode::TooLong));
        assert_eq!(align_up(usize::MAX - 2, 8), None);
    }

    #[test]
    fn iterator_names() {
        let i = builtin_primitive("int").unwrap();
        assert_eq!(iterator_descriptor(&i, false).name, "int*");
        let r = iterator_descriptor(&i, true);
        assert_eq!(r.name, "std::reverse_iterator<int*>");
        assert_eq!(r.t.as_iterator().unwrap().stride, 4);
        assert_eq!(array_descriptor(&i, 3).unwrap().name, "int[3]");
    }
}
