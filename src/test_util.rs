// Fakes for tests: target memory, module sources, debug info and a stopped process with the locals
//   std::array<int, 3> a = {3, 1, 2};
//   std::array<DbgInfo, 1> b = {DbgInfo{4}}; // debug info only has a declaration of the array type
//   std::array<int, 0> c;
//   std::array<int, 3> d; // at an unmapped address
use crate::{*, error::*, memory::*, module_interface::*, module_registry::*, symbols::*, resolver::*, pretty::*, expr::*, evaluator::*, context::*, settings::*};
use std::{collections::HashMap, sync::{Arc, Mutex, atomic::{AtomicUsize, Ordering}}, thread::{self, ThreadId}, time::Duration};

pub const A_ADDR: usize = 0x7ffd_4000_1000;
pub const B_ADDR: usize = A_ADDR + 0x100;
pub const C_ADDR: usize = A_ADDR + 0x200;
pub const D_ADDR: usize = 0x10;

pub struct FakeMemory {
    regions: Vec<(usize, Vec<u8>)>,
    // Number of read() calls, successful or not.
    pub reads: Arc<AtomicUsize>,
}

impl FakeMemory {
    pub fn new() -> Self { Self {regions: Vec::new(), reads: Arc::new(AtomicUsize::new(0))} }

    pub fn map(&mut self, addr: usize, data: &[u8]) { self.regions.push((addr, data.to_vec())); }
}

impl TargetMemory for FakeMemory {
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        for (start, data) in &self.regions {
            if addr >= *start && addr.checked_add(buf.len()).map_or(false, |end| end <= start + data.len()) {
                buf.copy_from_slice(&data[addr - start..addr - start + buf.len()]);
                return Ok(());
            }
        }
        err!(UnmappedMemory, "unmapped memory in 0x{:x}..+{}", addr, buf.len())
    }
}

fn scenario_memory() -> FakeMemory {
    let mut m = FakeMemory::new();
    let a: Vec<u8> = [3i32, 1, 2].iter().flat_map(|x| x.to_le_bytes()).collect();
    m.map(A_ADDR, &a);
    // Second int is only used by tests that give DbgInfo another member.
    let b: Vec<u8> = [4i32, 7].iter().flat_map(|x| x.to_le_bytes()).collect();
    m.map(B_ADDR, &b);
    m
}

pub fn scenario_symbols() -> SymbolsTable {
    let mut s = SymbolsTable::new();
    s.add_struct("std::__1::array<int, 3>", 12, &[("__elems_", 0, "int[3]")]).unwrap();
    s.add_struct("DbgInfo", 4, &[("v", 0, "int")]).unwrap();
    s.add_declaration("std::__1::array<DbgInfo, 1>").unwrap();
    s.add_struct("std::__1::array<int, 0>", 4, &[("__elems_", 0, "int[0]")]).unwrap();
    s
}

// Counts load() calls of the wrapped source, optionally making each one slow.
pub struct CountingSource<S: ModuleSource> {
    inner: S,
    counter: Arc<AtomicUsize>,
    delay: Duration,
}

impl<S: ModuleSource> CountingSource<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicUsize>) { Self::with_delay(inner, Duration::ZERO) }

    pub fn with_delay(inner: S, delay: Duration) -> (Self, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        (Self {inner, counter: counter.clone(), delay}, counter)
    }
}

impl<S: ModuleSource> ModuleSource for CountingSource<S> {
    fn load(&self, name: &str) -> Result<ModuleInterface> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.inner.load(name)
    }
}

// (module name, interface text) pairs.
pub struct TextModuleSource {
    pub modules: Vec<(String, String)>,
}

impl ModuleSource for TextModuleSource {
    fn load(&self, name: &str) -> Result<ModuleInterface> {
        match self.modules.iter().find(|(n, _)| n == name) {
            Some((_, text)) => ModuleInterface::parse(text),
            None => err!(Loading, "no module '{}'", name),
        }
    }
}

// Everything an EvalContext borrows, for testing formatters and the compiler without a Session.
pub struct Fixture {
    pub symbols: SymbolsTable,
    pub modules: ModuleCache,
    pub resolver: TypeResolver,
    pub memory: FakeMemory,
    pub formatters: FormatterRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        Self {symbols: scenario_symbols(), modules: ModuleCache::new(Box::new(BuiltinModuleSource)), resolver: TypeResolver::new(), memory: scenario_memory(), formatters: FormatterRegistry::with_builtin_rules()}
    }

    // Runs `f` as one request and commits resolved types.
    pub fn with<R, F: FnOnce(&mut EvalContext) -> R>(&mut self, import: bool, f: F) -> R {
        let mut types = self.resolver.scope(&self.symbols, &self.modules, import);
        let r = {
            let mut context = EvalContext {memory: &mut self.memory, types: &mut types, formatters: &self.formatters};
            f(&mut context)
        };
        types.commit();
        r
    }
}

pub fn local(c: &mut EvalContext, type_name: &str, addr: usize) -> Value {
    Value::at_addr(addr, c.types.resolve(type_name).unwrap())
}

fn scenario_frame() -> Frame {
    let locals = [("a", "std::__1::array<int, 3>", A_ADDR), ("b", "std::__1::array<DbgInfo, 1>", B_ADDR), ("c", "std::__1::array<int, 0>", C_ADDR), ("d", "std::__1::array<int, 3>", D_ADDR)];
    Frame {locals: locals.iter().map(|&(name, type_name, addr)| Local {name: name.to_string(), type_name: type_name.to_string(), addr}).collect()}
}

// a, b and c, with types resolved in `c`'s scope. b needs import.
pub fn scenario_locals(c: &mut EvalContext) -> ResolvedLocals {
    let mut r = ResolvedLocals::new();
    for l in scenario_frame().locals {
        if l.name != "d" {
            r.add(l.name.clone(), local(c, &l.type_name, l.addr));
        }
    }
    r
}

type RoutineResults = Arc<Mutex<HashMap<String, (Vec<u8>, String)>>>;

// Stopped process. Routines return canned results; unknown ones time out.
pub struct FakeProcess {
    memory: FakeMemory,
    routines: RoutineResults,
    executed: Arc<AtomicUsize>,
    cancel_on_execute: Arc<Mutex<Option<CancellationToken>>>,
    execute_delay: Arc<Mutex<Duration>>,
    // Which thread touched the process, in order: memory access and routine runs.
    accesses: Arc<Mutex<Vec<ThreadId>>>,
}

impl TargetProcess for FakeProcess {
    fn memory(&mut self) -> &mut dyn TargetMemory {
        self.accesses.lock().unwrap().push(thread::current().id());
        &mut self.memory
    }

    fn execute(&mut self, routine: &Routine, timeout: Duration) -> Result<(Vec<u8>, String)> {
        self.accesses.lock().unwrap().push(thread::current().id());
        self.executed.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = &*self.cancel_on_execute.lock().unwrap() {
            cancel.cancel();
        }
        let delay = *self.execute_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match self.routines.lock().unwrap().get(&routine.function) {
            Some(r) => Ok(r.clone()),
            None => err!(Timeout, "{}() didn't finish in {:?}", routine.function, timeout),
        }
    }
}

pub struct SessionFixture {
    pub session: Session,
    pub target: Target,
    pub frame: Frame,
    pub reads: Arc<AtomicUsize>,
    pub executed: Arc<AtomicUsize>,
    pub accesses: Arc<Mutex<Vec<ThreadId>>>,
    routines: RoutineResults,
    cancel_on_execute: Arc<Mutex<Option<CancellationToken>>>,
    execute_delay: Arc<Mutex<Duration>>,
}

impl SessionFixture {
    pub fn new(import_std_module: bool) -> Self {
        let settings = Settings {import_std_module, ..Settings::default()};
        let session = Session::with_module_source(settings, Arc::new(scenario_symbols()), Box::new(BuiltinModuleSource));
        let memory = scenario_memory();
        let reads = memory.reads.clone();
        let routines: RoutineResults = Arc::new(Mutex::new(HashMap::new()));
        let executed = Arc::new(AtomicUsize::new(0));
        let cancel_on_execute = Arc::new(Mutex::new(None));
        let execute_delay = Arc::new(Mutex::new(Duration::ZERO));
        let accesses = Arc::new(Mutex::new(Vec::new()));
        let process = FakeProcess {memory, routines: routines.clone(), executed: executed.clone(), cancel_on_execute: cancel_on_execute.clone(), execute_delay: execute_delay.clone(), accesses: accesses.clone()};
        Self {session, target: Target::new(Box::new(process)), frame: scenario_frame(), reads, executed, accesses, routines, cancel_on_execute, execute_delay}
    }

    // Makes every routine take this long.
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock().unwrap() = delay;
    }

    pub fn set_routine_result(&self, function: &str, bytes: Vec<u8>, type_name: &str) {
        self.routines.lock().unwrap().insert(function.to_string(), (bytes, type_name.to_string()));
    }

    // Cancels the token while the next routine runs.
    pub fn cancel_on_execute(&self, cancel: &CancellationToken) {
        *self.cancel_on_execute.lock().unwrap() = Some(cancel.clone());
    }
}
