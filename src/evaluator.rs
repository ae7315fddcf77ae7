use crate::{*, error::*, log::*, expr::*, memory::*, context::*};
use std::{sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}}, time::Duration};
use libc::pid_t;

// One evaluation request, from expression text to the rendered value tree:
//   resolve types of referenced locals -> compile -> (run in target) -> wrap as Value -> format.
// The target's mutex is held for the whole request, so requests against one target are serialized. Nothing is
// published to session caches unless the request succeeds.

// Code to run in the target, for calls the debugger can't evaluate itself.
#[derive(Clone, Debug)]
pub struct Routine {
    pub function: String,
    pub receiver: Option<Value>, // for member functions
    pub args: Vec<Value>,
    pub source: String, // expression text, for error messages and for the process to compile
}

#[derive(Debug)]
pub enum Compiled {
    // Computed by the debugger without running anything.
    Constant(Value),
    Routine(Routine),
}

// Locals referenced by the expression, with resolved types.
#[derive(Default)]
pub struct ResolvedLocals {
    values: Vec<(String, Value)>,
}

impl ResolvedLocals {
    pub fn new() -> Self { Self::default() }
    pub fn add(&mut self, name: String, v: Value) { self.values.push((name, v)); }
    pub fn get(&self, name: &str) -> Option<&Value> { self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v) }
    pub fn len(&self) -> usize { self.values.len() }
}

// Compiler front end.
pub trait Compiler: Send + Sync {
    // Names of variables the expression refers to. Only these locals get their types resolved.
    fn referenced_names(&self, text: &str) -> Result<Vec<String>>;
    fn compile(&self, text: &str, context: &mut EvalContext, locals: &ResolvedLocals) -> Result<Compiled>;
}

// The stopped inspected process.
pub trait TargetProcess: Send {
    fn memory(&mut self) -> &mut dyn TargetMemory;
    // Runs the routine and waits for it to finish, at most `timeout` (then it's a Timeout error; the process is left
    // stopped, not mid-call). Returns the result bytes and the result type name.
    fn execute(&mut self, routine: &Routine, timeout: Duration) -> Result<(Vec<u8>, String)>;
}

pub struct Target {
    pub process: Mutex<Box<dyn TargetProcess>>,
}

impl Target {
    pub fn new(process: Box<dyn TargetProcess>) -> Self { Self {process: Mutex::new(process)} }
}

// Live process that we can read but not run code in. Routines fail with NotImplemented.
pub struct PidProcess {
    memory: PidMemReader,
}

impl PidProcess {
    pub fn new(pid: pid_t) -> Self { Self {memory: PidMemReader::new(pid)} }
}

impl TargetProcess for PidProcess {
    fn memory(&mut self) -> &mut dyn TargetMemory { &mut self.memory }

    fn execute(&mut self, routine: &Routine, _timeout: Duration) -> Result<(Vec<u8>, String)> {
        err!(NotImplemented, "can't call {}() in process {}: running code in the target is not supported", routine.function, self.memory.pid)
    }
}

#[derive(Clone, Debug)]
pub struct Local {
    pub name: String,
    pub type_name: String,
    pub addr: usize,
}

// Stack frame the expression is evaluated in.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub locals: Vec<Local>,
}

#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return err!(Cancelled, "cancelled");
        }
        Ok(())
    }
}

pub fn evaluate(session: &Session, target: &Target, frame: &Frame, text: &str, cancel: &CancellationToken) -> Result<RenderedValue> {
    let mut prof = ProfileScope::with_threshold(0.2, format!("evaluating '{}'", text));
    let r = evaluate_impl(session, target, frame, text, cancel);
    if let Err(e) = &r {
        prof.disarm();
        log!(session.log.lock().unwrap(), "'{}': {}", text, e);
    }
    r
}

fn evaluate_impl(session: &Session, target: &Target, frame: &Frame, text: &str, cancel: &CancellationToken) -> Result<RenderedValue> {
    // Settings changes apply to requests started afterwards.
    let settings = session.settings();
    let symbols = session.symbols();
    let mut process = target.process.lock().unwrap();
    cancel.check()?;

    let mut types = session.types.scope(&*symbols, &session.modules, settings.import_std_module);
    let mut locals = ResolvedLocals::new();
    for name in session.compiler.referenced_names(text)? {
        // Unknown names are left for the compiler to report.
        let Some(local) = frame.locals.iter().find(|l| l.name == name) else { continue };
        let t = types.resolve(&local.type_name)?;
        locals.add(name, Value::at_addr(local.addr, t));
    }
    cancel.check()?;

    let compiled = {
        let mut memory = CachedMemReader::new(process.memory());
        let mut context = EvalContext {memory: &mut memory, types: &mut types, formatters: &session.formatters};
        session.compiler.compile(text, &mut context, &locals)?
    };
    cancel.check()?;

    let value = match compiled {
        Compiled::Constant(v) => v,
        Compiled::Routine(routine) => {
            let (bytes, type_name) = process.execute(&routine, settings.execute_timeout)?;
            // The call has completed by now, so stopping here doesn't leave the target mid-call.
            cancel.check()?;
            let t = types.resolve(&type_name)?;
            if bytes.len() < t.size {
                return err!(Runtime, "{}() returned {} bytes, but {} is {} bytes", routine.function, bytes.len(), t.display_name(), t.size);
            }
            Value::new(AddrOrValueBlob::Blob(ValueBlob::from_vec(bytes)), t)
        }
    };

    let limits = RenderLimits {max_children: settings.max_rendered_children, max_depth: settings.max_render_depth};
    let rendered = {
        // Fresh reader: memory may have changed if code ran in the target.
        let mut memory = CachedMemReader::new(process.memory());
        let mut context = EvalContext {memory: &mut memory, types: &mut types, formatters: &session.formatters};
        render_value(text.to_string(), &value, &limits, 0, &mut context)?
    };
    cancel.check()?;

    types.commit();
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use crate::{evaluator::*, test_util::*, settings::*, module_registry::*};
    use std::{sync::atomic::Ordering, thread, time::Duration};

    fn eval(f: &SessionFixture, text: &str) -> Result<RenderedValue> {
        evaluate(&f.session, &f.target, &f.frame, text, &CancellationToken::new())
    }

    fn scalar(f: &SessionFixture, text: &str) -> String {
        match eval(f, text) {
            Ok(r) => r.value.unwrap_or_else(|| panic!("'{}' is not a scalar", text)),
            Err(e) => panic!("'{}': {}", text, e),
        }
    }

    #[test]
    fn scenario_a_ints() {
        let f = SessionFixture::new(false);
        assert_eq!(scalar(&f, "a.size()"), "3");
        assert_eq!(scalar(&f, "a.front()"), "3");
        assert_eq!(scalar(&f, "a[1]"), "1");
        assert_eq!(scalar(&f, "a.back()"), "2");
        assert_eq!(scalar(&f, "*a.begin()"), "3");
        assert_eq!(scalar(&f, "*a.rbegin()"), "2");
        assert_eq!(scalar(&f, "a.at(0)"), "3");
        assert_eq!(scalar(&f, "a.max_size()"), "3");
        assert_eq!(scalar(&f, "a.empty()"), "false");
        assert_eq!(scalar(&f, "*(a.rbegin() + 2)"), "3");

        let r = eval(&f, "a.size()").unwrap();
        assert_eq!((r.type_name.as_str(), r.shown_type()), ("unsigned long", "size_type"));
        assert_eq!(eval(&f, "a.front()").unwrap().shown_type(), "value_type");
        assert_eq!(eval(&f, "*a.rbegin()").unwrap().shown_type(), "int");
        assert_eq!(eval(&f, "a.begin()").unwrap().shown_type(), "iterator");
        assert_eq!(eval(&f, "a.rbegin()").unwrap().type_name, "std::reverse_iterator<int*>");
    }

    #[test]
    fn scenario_a_rendering() {
        let f = SessionFixture::new(false);
        let r = eval(&f, "a").unwrap();
        assert_eq!(r.type_name, "std::array<int, 3>");
        assert_eq!(r.value.as_deref(), Some("size=3"));
        let children: Vec<(&str, Option<&str>)> = r.children.iter().map(|c| (c.name.as_str(), c.value.as_deref())).collect();
        assert_eq!(children, vec![("[0]", Some("3")), ("[1]", Some("1")), ("[2]", Some("2"))]);
        assert!(!r.truncated);
    }

    #[test]
    fn scenario_b_import_fills_declaration() {
        let f = SessionFixture::new(true);
        assert_eq!(scalar(&f, "b.size()"), "1");
        for text in ["b.front()", "b[0]", "b.back()", "*b.begin()", "*b.rbegin()", "b.at(0)"] {
            let r = eval(&f, text).unwrap();
            assert_eq!(r.type_name, "DbgInfo", "{}", text);
            assert_eq!(r.value, None);
            assert_eq!(r.child("v").and_then(|c| c.value.as_deref()), Some("4"), "{}", text);
        }
        let r = eval(&f, "b").unwrap();
        assert_eq!(r.type_name, "std::array<DbgInfo, 1>");
        assert_eq!(r.child("[0]").and_then(|c| c.child("v")).and_then(|c| c.value.as_deref()), Some("4"));
        assert_eq!(scalar(&f, "b.front().v"), "4");
    }

    #[test]
    fn scenario_c_empty() {
        let f = SessionFixture::new(false);
        let reads_before = f.reads.load(Ordering::SeqCst);
        assert_eq!(scalar(&f, "c.size()"), "0");
        assert!(eval(&f, "c.front()").unwrap_err().is_empty_container());
        assert!(eval(&f, "c.back()").unwrap_err().is_empty_container());
        assert!(eval(&f, "c[0]").unwrap_err().is_no_such_child());
        let r = eval(&f, "c").unwrap();
        assert_eq!((r.value.as_deref(), r.children.len()), (Some("size=0"), 0));
        assert_eq!(f.reads.load(Ordering::SeqCst), reads_before);
    }

    #[test]
    fn import_toggle() {
        let f = SessionFixture::new(true);
        assert!(eval(&f, "b.front()").is_ok());
        let cached = f.session.types.len();
        f.session.set("import-std-module", "false").unwrap();
        let e = eval(&f, "b.front()").unwrap_err();
        assert!(e.is_incomplete_type());
        assert!(e.message.contains("std::array<DbgInfo, 1>"));
        assert_eq!(f.session.types.len(), cached);
        // Complete debug info doesn't need the module.
        assert_eq!(scalar(&f, "a[2]"), "2");
        f.session.set_import_std_module(true);
        assert!(eval(&f, "b.front()").is_ok());
        assert_eq!(f.session.modules.loads_started(), 1);
        assert!(f.session.log.lock().unwrap().lines.iter().any(|l| l.contains("'b.front()'") && l.contains("import-std-module is off")));
    }

    #[test]
    fn failed_request_changes_nothing() {
        let f = SessionFixture::new(true);
        let e = eval(&f, "b.front() + nope").unwrap_err();
        assert!(e.is_no_variable());
        assert_eq!(f.session.types.len(), 0);
        assert!(f.session.modules.list().is_empty());
        assert!(eval(&f, "b.front().v").is_ok());
        assert_eq!(f.session.modules.list(), vec!["std".to_string()]);
    }

    #[test]
    fn routines_run_in_target() {
        let f = SessionFixture::new(false);
        f.set_routine_result("compute", 42i32.to_le_bytes().to_vec(), "int");
        assert_eq!(scalar(&f, "compute(a.size(), 1)"), "42");
        assert_eq!(f.executed.load(Ordering::SeqCst), 1);

        f.set_routine_result("raw", vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0], "std::array<int, 3>");
        let r = eval(&f, "raw()").unwrap();
        assert_eq!(r.child("[2]").and_then(|c| c.value.as_deref()), Some("3"));

        f.set_routine_result("short", vec![1], "long");
        assert!(eval(&f, "short()").unwrap_err().message.contains("returned 1 bytes"));

        // Unknown routine: the fake process reports a timeout, which passes through.
        let e = eval(&f, "a.swap(a)").unwrap_err();
        assert!(e.is_process_error());
        assert_eq!(e.code(), Some(ErrorCode::Timeout));
    }

    #[test]
    fn cancellation() {
        let f = SessionFixture::new(false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(evaluate(&f.session, &f.target, &f.frame, "a[0]", &cancel).unwrap_err().is_cancelled());
        assert_eq!(f.reads.load(Ordering::SeqCst), 0);

        // Cancelled while the routine was running: wait for it, then report.
        f.set_routine_result("compute", vec![0; 8], "long");
        let cancel = CancellationToken::new();
        f.cancel_on_execute(&cancel);
        assert!(evaluate(&f.session, &f.target, &f.frame, "compute()", &cancel).unwrap_err().is_cancelled());
        assert_eq!(f.executed.load(Ordering::SeqCst), 1);
        assert_eq!(f.session.types.len(), 0);
    }

    #[test]
    fn requests_on_one_target_are_serialized() {
        let f = SessionFixture::new(false);
        f.set_routine_result("compute", 42i32.to_le_bytes().to_vec(), "int");
        f.set_execute_delay(Duration::from_millis(50));
        thread::scope(|s| {
            let threads: Vec<_> = (0..2).map(|_| s.spawn(|| scalar(&f, "compute(a[0])"))).collect();
            for t in threads {
                assert_eq!(t.join().unwrap(), "42");
            }
        });
        assert_eq!(f.executed.load(Ordering::SeqCst), 2);

        // Each request reads memory to compile, runs the routine, reads again to render. None of it interleaves with
        // the other request.
        let accesses = f.accesses.lock().unwrap();
        assert_eq!(accesses.len(), 6);
        let switches = accesses.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1, "{:?}", accesses);
    }

    #[test]
    fn own_process() {
        let x: [i32; 3] = [5, 6, 7];
        let x = std::hint::black_box(&x);
        let session = Session::with_module_source(Settings::default(), Arc::new(scenario_symbols()), Box::new(BuiltinModuleSource));
        let target = Target::new(Box::new(PidProcess::new(std::process::id() as pid_t)));
        let frame = Frame {locals: vec![Local {name: "x".to_string(), type_name: "std::__1::array<int, 3>".to_string(), addr: x.as_ptr() as usize}]};
        let cancel = CancellationToken::new();
        match evaluate(&session, &target, &frame, "x[2]", &cancel) {
            Ok(r) => assert_eq!(r.value.as_deref(), Some("7")),
            Err(e) => {
                eprintln!("warning: process_vm_readv unavailable, skipping: {}", e);
                return;
            }
        }
        let r = evaluate(&session, &target, &frame, "x", &cancel).unwrap();
        let children: Vec<Option<&str>> = r.children.iter().map(|c| c.value.as_deref()).collect();
        assert_eq!(children, vec![Some("5"), Some("6"), Some("7")]);
        let e = evaluate(&session, &target, &frame, "f(x[0])", &cancel).unwrap_err();
        assert_eq!(e.code(), Some(ErrorCode::NotImplemented));
    }

    #[test]
    fn render_limits() {
        let f = SessionFixture::new(false);
        f.session.set("max-rendered-children", "2").unwrap();
        let r = eval(&f, "a").unwrap();
        assert_eq!(r.children.len(), 2);
        assert!(r.truncated);
        f.session.set("max-render-depth", "0").unwrap();
        let r = eval(&f, "a").unwrap();
        assert!(r.children.is_empty());
        assert!(r.truncated);
        assert_eq!(r.value.as_deref(), Some("size=3"));
    }

    #[test]
    fn unmapped_memory_fails_request() {
        let f = SessionFixture::new(false);
        assert!(eval(&f, "d[0]").unwrap_err().is_unmapped_memory());
        // Computing the address doesn't need the memory.
        assert_eq!(scalar(&f, "d.size()"), "3");
    }
}
