use crate::{*, error::*, types::*, type_name::*, log::*};
use std::collections::HashMap;
use gimli::{constants::*, DebugInfoOffset, Dwarf, EndianSlice, LittleEndian, SectionId, Unit, UnitOffset, AttributeValue, DebuggingInformationEntry, EntriesTreeNode};

// Type lookup in the target's debug information.
// Returned descriptors may be incomplete: TypeFlags::DECLARATION for forward declarations, TypeFlags::OPAQUE for types
// the compiler emitted without members. The resolver fills such gaps from module interfaces.
pub trait DebugSymbols: Send + Sync {
    // `name` is canonical: normalized spelling, no inline namespaces.
    fn find_type(&self, name: &str) -> Option<TypeDescriptor>;
}

// In-memory debug info, populated by a loader (or by hand in tests). Keyed by canonical name.
pub struct SymbolsTable {
    types: HashMap<String, TypeDescriptor>,
    next_die: usize,
}

impl SymbolsTable {
    pub fn new() -> Self { Self {types: HashMap::new(), next_die: 0x0b} }

    pub fn add(&mut self, mut t: TypeDescriptor) {
        if t.die.0 == 0 {
            t.die = DebugInfoOffset(self.next_die);
            self.next_die += 0x20;
        }
        let key = t.expr.canonical().to_string();
        self.types.insert(key, t);
    }

    // Struct with members at given offsets, as DW_TAG_structure_type with DW_TAG_member children would describe it.
    pub fn add_struct(&mut self, name: &str, size: usize, fields: &[(&str, usize, &str)]) -> Result<()> {
        self.add(struct_type(name, size, fields)?);
        Ok(())
    }

    pub fn add_typedefs(&mut self, name: &str, typedefs: &[(&str, &str)]) -> Result<()> {
        let key = parse_type_name(name)?.canonical().to_string();
        let Some(t) = self.types.get_mut(&key) else { return err!(NoVariable, "no type '{}' to add typedefs to", name) };
        for &(n, target) in typedefs {
            t.nested_types.push((n.to_string(), normalize_type_name(target)?));
        }
        Ok(())
    }

    // DW_AT_declaration without a definition anywhere.
    pub fn add_declaration(&mut self, name: &str) -> Result<()> {
        self.add(declaration_type(name)?);
        Ok(())
    }

    // Size is known, members are not.
    pub fn add_opaque(&mut self, name: &str, size: usize) -> Result<()> {
        self.add(opaque_type(name, size)?);
        Ok(())
    }

    pub fn len(&self) -> usize { self.types.len() }

    // Named structs, classes and unions from DWARF sections. `section` returns the contents of a section, empty if
    // the binary doesn't have it. Types whose debug info we can't represent are skipped with a warning.
    pub fn from_dwarf<'a>(mut section: impl FnMut(SectionId) -> &'a [u8]) -> Result<Self> {
        let _prof = ProfileScope::with_threshold(0.1, "loading types from DWARF".to_string());
        let dwarf = Dwarf::load(|id| -> gimli::Result<DwarfSlice<'a>> { Ok(EndianSlice::new(section(id), LittleEndian)) })?;
        let mut table = Self::new();
        let mut skipped: Vec<(String, Error)> = Vec::new();
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let mut types = UnitTypes {dwarf: &dwarf, unit: &unit, scope: Vec::new(), names: HashMap::new(), structs: Vec::new()};
            {
                let mut tree = unit.entries_tree(None)?;
                types.walk(tree.root()?)?;
            }
            types.add_to(&mut table, &mut skipped);
        }
        if let Some((name, e)) = skipped.first() {
            eprintln!("warning: skipped {} types with unsupported debug info, e.g. {}: {}", skipped.len(), name, e);
        }
        Ok(table)
    }
}

fn struct_type(name: &str, size: usize, fields: &[(&str, usize, &str)]) -> Result<TypeDescriptor> {
    let expr = parse_type_name(name)?;
    let mut fields_out: Vec<StructField> = Vec::new();
    for &(field_name, offset, type_name) in fields {
        if offset > size {
            return err!(Dwarf, "field {} of {} at offset {} is outside the struct ({} bytes)", field_name, name, offset, size);
        }
        fields_out.push(StructField {name: field_name.to_string(), offset, type_name: normalize_type_name(type_name)?});
    }
    let mut t = TypeDescriptor::new(expr, Type::Struct(StructType {fields: fields_out}), size, guess_alignment(size));
    t.name = name.to_string();
    Ok(t)
}

fn declaration_type(name: &str) -> Result<TypeDescriptor> {
    let mut t = TypeDescriptor::new(parse_type_name(name)?, Type::Struct(StructType::default()), 0, 1);
    t.name = name.to_string();
    t.flags = TypeFlags::DECLARATION;
    Ok(t)
}

fn opaque_type(name: &str, size: usize) -> Result<TypeDescriptor> {
    let mut t = TypeDescriptor::new(parse_type_name(name)?, Type::Struct(StructType::default()), size, guess_alignment(size));
    t.name = name.to_string();
    t.flags = TypeFlags::OPAQUE | TypeFlags::SIZE_KNOWN;
    Ok(t)
}

type DwarfSlice<'a> = EndianSlice<'a, LittleEndian>;

struct StructDie {
    name: String, // qualified, as written in debug info
    die: DebugInfoOffset,
    size: Option<u64>,
    declaration: bool,
    members: Vec<(String, usize, UnitOffset)>,
    typedefs: Vec<(String, UnitOffset)>,
    // First member we couldn't make sense of. The struct is skipped.
    problem: Option<String>,
}

// Named types of one compilation unit.
struct UnitTypes<'a, 'u> {
    dwarf: &'u Dwarf<DwarfSlice<'a>>,
    unit: &'u Unit<DwarfSlice<'a>>,
    // Enclosing namespaces and structs.
    scope: Vec<String>,
    // Qualified names of named structs, enums and base types. Typedefs, cv-qualifiers, pointers and arrays are
    // named on demand by type_name().
    names: HashMap<UnitOffset, String>,
    structs: Vec<StructDie>,
}

impl<'a, 'u> UnitTypes<'a, 'u> {
    fn qualified(&self, name: &str) -> String {
        let mut s = String::new();
        for n in &self.scope {
            s.push_str(n);
            s.push_str("::");
        }
        s.push_str(name);
        s
    }

    fn name_attr(&self, entry: &DebuggingInformationEntry<DwarfSlice<'a>>) -> Result<Option<String>> {
        Ok(match entry.attr_value(DW_AT_name)? {
            Some(v) => Some(self.dwarf.attr_string(self.unit, v)?.to_string_lossy().into_owned()),
            None => None,
        })
    }

    fn walk(&mut self, node: EntriesTreeNode<'_, '_, '_, DwarfSlice<'a>>) -> Result<()> {
        let entry = node.entry();
        let (tag, offset) = (entry.tag(), entry.offset());
        let name = self.name_attr(entry)?;
        let mut struct_idx: Option<usize> = None;
        let mut pushed_scope = false;
        match (tag, &name) {
            (DW_TAG_namespace, Some(n)) => {
                self.scope.push(n.clone());
                pushed_scope = true;
            }
            (DW_TAG_base_type, Some(n)) => { self.names.insert(offset, base_type_name(n)); }
            (DW_TAG_enumeration_type, Some(n)) => { self.names.insert(offset, self.qualified(n)); }
            (DW_TAG_structure_type | DW_TAG_class_type | DW_TAG_union_type, Some(n)) => {
                let qualified = self.qualified(n);
                self.names.insert(offset, qualified.clone());
                let size = entry.attr_value(DW_AT_byte_size)?.and_then(|v| v.udata_value());
                let declaration = entry.attr_value(DW_AT_declaration)? == Some(AttributeValue::Flag(true));
                let die = offset.to_debug_info_offset(&self.unit.header).unwrap_or(DebugInfoOffset(0));
                struct_idx = Some(self.structs.len());
                self.structs.push(StructDie {name: qualified, die, size, declaration, members: Vec::new(), typedefs: Vec::new(), problem: None});
                self.scope.push(n.clone());
                pushed_scope = true;
            }
            // Anonymous structs can't be looked up by name. Members referring to them make the containing struct
            // unrepresentable, see type_name().
            _ => (),
        }

        let mut children = node.children();
        while let Some(child) = children.next()? {
            if let Some(idx) = struct_idx {
                if let Err(e) = self.add_struct_child(idx, child.entry()) {
                    self.structs[idx].problem.get_or_insert(e.to_string());
                }
            }
            self.walk(child)?;
        }
        if pushed_scope {
            self.scope.pop();
        }
        Ok(())
    }

    fn add_struct_child(&mut self, idx: usize, entry: &DebuggingInformationEntry<DwarfSlice<'a>>) -> Result<()> {
        match entry.tag() {
            DW_TAG_member => {
                // Static members have no location.
                let Some(location) = entry.attr_value(DW_AT_data_member_location)? else { return Ok(()) };
                let Some(offset) = location.udata_value() else { return err!(Dwarf, "unsupported DW_AT_data_member_location @0x{:x}", entry.offset().0) };
                let name = self.name_attr(entry)?.unwrap_or_default();
                let Some(type_) = type_ref(entry)? else { return err!(Dwarf, "member {} has no type", name) };
                self.structs[idx].members.push((name, offset as usize, type_));
            }
            DW_TAG_typedef => {
                if let (Some(name), Some(type_)) = (self.name_attr(entry)?, type_ref(entry)?) {
                    self.structs[idx].typedefs.push((name, type_));
                }
            }
            _ => (),
        }
        Ok(())
    }

    fn type_name(&self, offset: UnitOffset, depth: usize) -> Result<String> {
        if let Some(n) = self.names.get(&offset) {
            return Ok(n.clone());
        }
        if depth > 32 {
            return err!(Dwarf, "type chain too long @0x{:x}", offset.0);
        }
        let entry = self.unit.entry(offset)?;
        let inner = match type_ref(&entry)? {
            Some(t) => self.type_name(t, depth + 1)?,
            None => "void".to_string(),
        };
        Ok(match entry.tag() {
            DW_TAG_typedef | DW_TAG_const_type | DW_TAG_volatile_type | DW_TAG_restrict_type | DW_TAG_atomic_type => inner,
            DW_TAG_pointer_type => format!("{}*", inner),
            DW_TAG_reference_type | DW_TAG_rvalue_reference_type => format!("{}&", inner),
            DW_TAG_array_type => {
                // One DW_TAG_subrange_type per dimension, outermost first.
                let mut s = inner;
                let mut tree = self.unit.entries_tree(Some(offset))?;
                let mut children = tree.root()?.children();
                while let Some(child) = children.next()? {
                    let e = child.entry();
                    if e.tag() != DW_TAG_subrange_type {
                        continue;
                    }
                    let len = match (e.attr_value(DW_AT_count)?.and_then(|v| v.udata_value()), e.attr_value(DW_AT_upper_bound)?.and_then(|v| v.udata_value())) {
                        (Some(n), _) => n,
                        (None, Some(upper)) => upper + 1,
                        // Flexible array member.
                        (None, None) => 0,
                    };
                    s.push_str(&format!("[{}]", len));
                }
                s
            }
            tag => return err!(Dwarf, "unnamed {} @0x{:x}", tag, offset.0),
        })
    }

    fn struct_descriptor(&self, s: &StructDie) -> Result<TypeDescriptor> {
        if let Some(p) = &s.problem {
            return err!(Dwarf, "{}", p);
        }
        let Some(size) = s.size else { return err!(Dwarf, "no DW_AT_byte_size") };
        let size = size as usize;
        let mut members: Vec<(String, usize, String)> = Vec::new();
        for (name, offset, type_) in &s.members {
            members.push((name.clone(), *offset, self.type_name(*type_, 0)?));
        }
        // A struct with no members usually means the compiler omitted them, unless it's empty (size 1).
        let mut t = if members.is_empty() && size > 1 {
            opaque_type(&s.name, size)?
        } else {
            let refs: Vec<(&str, usize, &str)> = members.iter().map(|(n, o, t)| (n.as_str(), *o, t.as_str())).collect();
            struct_type(&s.name, size, &refs)?
        };
        for (name, type_) in &s.typedefs {
            t.nested_types.push((name.clone(), normalize_type_name(&self.type_name(*type_, 0)?)?));
        }
        t.die = s.die;
        Ok(t)
    }

    fn add_to(self, table: &mut SymbolsTable, skipped: &mut Vec<(String, Error)>) {
        for s in &self.structs {
            let r = if s.declaration {
                // Definitions win over declarations, whichever unit comes first.
                declaration_type(&s.name).map(|mut t| {
                    t.die = s.die;
                    if !table.types.contains_key(&t.expr.canonical().to_string()) {
                        table.add(t);
                    }
                })
            } else {
                self.struct_descriptor(s).map(|t| table.add(t))
            };
            if let Err(e) = r {
                skipped.push((s.name.clone(), e));
            }
        }
    }
}

fn type_ref(entry: &DebuggingInformationEntry<DwarfSlice<'_>>) -> Result<Option<UnitOffset>> {
    match entry.attr_value(DW_AT_type)? {
        None => Ok(None),
        Some(AttributeValue::UnitRef(o)) => Ok(Some(o)),
        Some(v) => err!(Dwarf, "unsupported type reference {:?} @0x{:x}", v, entry.offset().0),
    }
}

// GCC spells some base types differently: "long unsigned int" is "unsigned long".
fn base_type_name(name: &str) -> String {
    let words: Vec<&str> = name.split(' ').collect();
    let known = ["unsigned", "signed", "short", "long", "int", "char"];
    if words.len() < 2 || !words.iter().all(|w| known.contains(w)) {
        return name.to_string();
    }
    let has = |w: &str| words.contains(&w);
    let longs = words.iter().filter(|w| **w == "long").count();
    let base = if has("char") {
        if has("signed") { "signed char" } else { "char" }
    } else if has("short") {
        "short"
    } else if longs >= 2 {
        "long long"
    } else if longs == 1 {
        "long"
    } else {
        "int"
    };
    if has("unsigned") { format!("unsigned {}", base) } else { base.to_string() }
}

impl DebugSymbols for SymbolsTable {
    fn find_type(&self, name: &str) -> Option<TypeDescriptor> {
        self.types.get(name).cloned()
    }
}
