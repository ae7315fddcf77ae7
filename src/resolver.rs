use crate::{*, error::*, types::*, type_name::*, symbols::*, module_registry::*, module_interface::*};
use std::{collections::HashMap, sync::{Arc, Mutex}};

// Turns type names into complete TypeDescriptor-s.
//
// Lookup order for a named type:
//  1. builtin primitive types,
//  2. debug info,
//  3. if debug info has no definition (missing, declaration only, or opaque), the module interface that declares the
//     type, if import is enabled. The imported declaration fills members and nested typedefs; whatever debug info
//     does know (size, member offsets) must agree with the import, otherwise it's DescriptorConflict.
//
// Results are memoized per session, keyed by canonical name. The memo is only written when a request succeeds:
// each request resolves through a ResolveScope, which accumulates new descriptors and commits them at the end.
pub struct TypeResolver {
    memo: Mutex<HashMap<String, Arc<TypeDescriptor>>>,
}

// Which module interface describes a type. Only std is known.
pub fn module_for_type(expr: &TypeExpr) -> Option<&'static str> {
    match expr.top_namespace() {
        Some("std") => Some("std"),
        _ => None,
    }
}

impl TypeResolver {
    pub fn new() -> Self { Self {memo: Mutex::new(HashMap::new())} }

    // Debug info was reloaded.
    pub fn clear(&self) { self.memo.lock().unwrap().clear(); }

    pub fn len(&self) -> usize { self.memo.lock().unwrap().len() }

    pub fn scope<'a>(&'a self, symbols: &'a dyn DebugSymbols, modules: &'a ModuleCache, import_enabled: bool) -> ResolveScope<'a> {
        ResolveScope {resolver: self, symbols, modules, import_enabled, pending: HashMap::new(), in_progress: Vec::new(), loaded_modules: Vec::new()}
    }
}

// Per-request view of the resolver. Dropping it without commit() discards everything it resolved and forgets the
// modules it loaded.
pub struct ResolveScope<'a> {
    resolver: &'a TypeResolver,
    symbols: &'a dyn DebugSymbols,
    modules: &'a ModuleCache,
    import_enabled: bool,
    pending: HashMap<String, Arc<TypeDescriptor>>,
    in_progress: Vec<String>,
    loaded_modules: Vec<String>,
}

impl<'a> ResolveScope<'a> {
    pub fn import_enabled(&self) -> bool { self.import_enabled }
    pub fn num_pending(&self) -> usize { self.pending.len() }

    pub fn resolve(&mut self, name: &str) -> Result<Arc<TypeDescriptor>> {
        let expr = parse_type_name(name)?;
        self.resolve_expr(&expr)
    }

    pub fn resolve_expr(&mut self, expr: &TypeExpr) -> Result<Arc<TypeDescriptor>> {
        // Values of reference type are just values of the referenced type.
        if let TypeExpr::Reference(t) = expr {
            return self.resolve_expr(t);
        }
        let canonical = expr.canonical();
        let key = canonical.to_string();
        if let Some(t) = self.pending.get(&key) {
            return Ok(t.clone());
        }
        let cached = self.resolver.memo.lock().unwrap().get(&key).cloned();
        if let Some(t) = cached {
            if t.completeness() == Completeness::ImportFilled && !self.import_enabled {
                return err!(IncompleteType, "debug info for {} is incomplete, and import-std-module is off", key);
            }
            return Ok(t);
        }
        if self.in_progress.contains(&key) {
            return err!(IncompleteType, "{} contains itself", key);
        }

        self.in_progress.push(key.clone());
        let res = self.resolve_uncached(&canonical);
        self.in_progress.pop();
        let t = res?;
        self.pending.insert(key, t.clone());
        Ok(t)
    }

    fn resolve_uncached(&mut self, canonical: &TypeExpr) -> Result<Arc<TypeDescriptor>> {
        Ok(Arc::new(match canonical {
            TypeExpr::Reference(t) => return self.resolve_expr(t),
            TypeExpr::Pointer(p) => pointer_descriptor(p),
            TypeExpr::Array(e, n) => {
                let element = self.resolve_expr(e)?;
                array_descriptor(&element, *n)?
            }
            TypeExpr::DependentArray(_, n) => return err!(TypeMismatch, "array length '{}' is not a number", n),
            TypeExpr::Nested(outer, member) => {
                let outer = self.resolve_expr(outer)?;
                let Some(target) = outer.nested_type(member) else { return err!(IncompleteType, "{} has no member type '{}'", outer.name, member) };
                let target = target.to_string();
                return self.resolve(&target);
            }
            TypeExpr::Named {..} => self.resolve_named(canonical)?,
        }))
    }

    fn resolve_named(&mut self, canonical: &TypeExpr) -> Result<TypeDescriptor> {
        let key = canonical.to_string();
        if canonical.template_args().is_empty() {
            if let Some(p) = builtin_primitive(&key) {
                return Ok(p);
            }
        }
        match self.symbols.find_type(&key) {
            Some(d) if d.is_complete() => self.fill_typedefs(canonical, d),
            d => self.import(canonical, d),
        }
    }

    // Complete type from debug info, but compilers often omit typedefs nobody used.
    fn fill_typedefs(&mut self, canonical: &TypeExpr, mut d: TypeDescriptor) -> Result<TypeDescriptor> {
        if !self.import_enabled || !d.nested_types.is_empty() || d.t.as_struct().is_none() {
            return Ok(d);
        }
        let (Some(module), Some(base)) = (module_for_type(canonical), canonical.base_name()) else { return Ok(d) };
        let m = match self.load_module(module) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("warning: not filling typedefs of {}: {}", d.name, e);
                return Ok(d);
            }
        };
        if let Some(decl) = m.find(base) {
            match decl.instantiate(canonical.template_args()) {
                Ok(inst) => d.nested_types = inst.typedefs,
                Err(e) => eprintln!("warning: not filling typedefs of {}: {}", d.name, e),
            }
        }
        Ok(d)
    }

    fn import(&mut self, canonical: &TypeExpr, from_debug_info: Option<TypeDescriptor>) -> Result<TypeDescriptor> {
        let key = canonical.to_string();
        let problem = match &from_debug_info {
            None => "no definition in debug info",
            Some(d) if d.flags.contains(TypeFlags::DECLARATION) => "only a declaration in debug info",
            Some(_) => "no members in debug info",
        };
        let Some(module) = module_for_type(canonical) else { return err!(IncompleteType, "{}: {}", key, problem) };
        if !self.import_enabled {
            return err!(IncompleteType, "{}: {} (import-std-module is off)", key, problem);
        }
        let m = self.load_module(module).map_err(|e| error!(IncompleteType, "{}: {}, and module {} is unavailable: {}", key, problem, module, e))?;
        let Some(decl) = canonical.base_name().and_then(|b| m.find(b)) else { return err!(IncompleteType, "{}: {}, and module {} doesn't declare it", key, problem, module) };
        let inst = decl.instantiate(canonical.template_args())?;

        let mut members: Vec<(String, Arc<TypeDescriptor>)> = Vec::new();
        for (name, t) in &inst.fields {
            members.push((name.clone(), self.resolve_expr(t)?));
        }
        let refs: Vec<(String, &TypeDescriptor)> = members.iter().map(|(n, t)| (n.clone(), &**t)).collect();
        let (fields, size, align) = layout_struct_fields(&refs)?;

        let mut t = TypeDescriptor::new(canonical.clone(), Type::Struct(StructType {fields}), size, align);
        t.flags.insert(TypeFlags::IMPORT_FILLED);
        t.nested_types = inst.typedefs;
        if let Some(d) = from_debug_info {
            merge_debug_info(&mut t, d, module)?;
        }
        Ok(t)
    }

    fn load_module(&mut self, name: &str) -> Result<Arc<ModuleInterface>> {
        let (m, loaded_now) = self.modules.load_tracked(name)?;
        if loaded_now {
            self.loaded_modules.push(name.to_string());
        }
        Ok(m)
    }

    // Publishes everything resolved by this request.
    pub fn commit(mut self) {
        let resolver = self.resolver;
        let mut memo = resolver.memo.lock().unwrap();
        for (key, t) in self.pending.drain() {
            memo.entry(key).or_insert(t);
        }
        self.loaded_modules.clear();
    }
}

impl Drop for ResolveScope<'_> {
    fn drop(&mut self) {
        for m in &self.loaded_modules {
            self.modules.forget(m);
        }
    }
}

// What debug info knows wins, but it must agree with the import.
fn merge_debug_info(t: &mut TypeDescriptor, d: TypeDescriptor, module: &str) -> Result<()> {
    if d.flags.contains(TypeFlags::OPAQUE) {
        if d.size != t.size {
            return err!(DescriptorConflict, "{}: debug info says {} bytes, module {} says {}", t.name, d.size, module, t.size);
        }
        for f in d.fields() {
            match t.field(&f.name) {
                Some(g) if g.offset == f.offset => (),
                Some(g) => return err!(DescriptorConflict, "{}: member {} is at offset {} in debug info, {} in module {}", t.name, f.name, f.offset, g.offset, module),
                None => return err!(DescriptorConflict, "{}: member {} from debug info is not in module {}", t.name, f.name, module),
            }
        }
    }
    for (n, target) in d.nested_types {
        match t.nested_types.iter_mut().find(|(m, _)| *m == n) {
            Some(x) => x.1 = target,
            None => t.nested_types.push((n, target)),
        }
    }
    t.name = d.name;
    t.expr = d.expr;
    t.die = d.die;
    Ok(())
}
