use crate::{*, error::*, module_interface::*, log::*};
use std::{fs::File, path::PathBuf, collections::{HashMap, hash_map::Entry}, sync::{Arc, Mutex, Condvar}, sync::atomic::{AtomicUsize, Ordering}, str};
use memmap2::Mmap;

// Where module interfaces come from.
pub trait ModuleSource: Send + Sync {
    fn load(&self, name: &str) -> Result<ModuleInterface>;
}

// <dir>/<name>.iface files, first match in search path order.
pub struct FileModuleSource {
    pub search_path: Vec<PathBuf>,
}

impl ModuleSource for FileModuleSource {
    fn load(&self, name: &str) -> Result<ModuleInterface> {
        if name.is_empty() || name.contains('/') {
            return err!(Usage, "bad module name: '{}'", name);
        }
        for dir in &self.search_path {
            let path = dir.join(format!("{}.iface", name));
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::from_io_error(e, format!("failed to open {}", path.display()))),
            };
            let mmap = unsafe { Mmap::map(&file)? };
            let text = str::from_utf8(&mmap[..])?;
            let m = ModuleInterface::parse(text).map_err(|e| error!(Loading, "{}: {}", path.display(), e))?;
            if m.name != name {
                return err!(Loading, "{} describes module '{}', expected '{}'", path.display(), m.name, name);
            }
            return Ok(m);
        }
        err!(Loading, "module interface for '{}' not found", name)
    }
}

pub struct BuiltinModuleSource;

impl ModuleSource for BuiltinModuleSource {
    fn load(&self, name: &str) -> Result<ModuleInterface> {
        match name {
            "std" => ModuleInterface::parse(BUILTIN_STD_INTERFACE),
            _ => err!(Loading, "no builtin interface for module '{}'", name),
        }
    }
}

// Tries sources in order, returns the first success, or the last error.
pub struct ChainModuleSource {
    pub sources: Vec<Box<dyn ModuleSource>>,
}

impl ModuleSource for ChainModuleSource {
    fn load(&self, name: &str) -> Result<ModuleInterface> {
        let mut last_error = error!(Loading, "no module sources");
        for s in &self.sources {
            match s.load(name) {
                Ok(m) => return Ok(m),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

// Session-scoped cache of loaded module interfaces.
// The first request for a name does the load; concurrent requests for the same name wait for it and share the result.
// Failed loads are not cached, the next request tries again.
pub struct ModuleCache {
    source: Box<dyn ModuleSource>,
    slots: Mutex<HashMap<String, Slot>>,
    loads_started: AtomicUsize,
}

enum Slot {
    Loading(Arc<PendingLoad>),
    // `shared` is set once anyone other than the loader got the module.
    Loaded {module: Arc<ModuleInterface>, shared: bool},
}

struct PendingLoad {
    result: Mutex<Option<Result<Arc<ModuleInterface>>>>,
    done: Condvar,
    // Incremented under the slots lock.
    waiters: AtomicUsize,
}

impl PendingLoad {
    fn wait(&self) -> Result<Arc<ModuleInterface>> {
        let mut lock = self.result.lock().unwrap();
        loop {
            if let Some(r) = &*lock {
                return r.clone();
            }
            lock = self.done.wait(lock).unwrap();
        }
    }

    fn finish(&self, res: Result<Arc<ModuleInterface>>) {
        *self.result.lock().unwrap() = Some(res);
        self.done.notify_all();
    }
}

impl ModuleCache {
    pub fn new(source: Box<dyn ModuleSource>) -> Self { Self {source, slots: Mutex::new(HashMap::new()), loads_started: AtomicUsize::new(0)} }

    pub fn load(&self, name: &str) -> Result<Arc<ModuleInterface>> {
        Ok(self.load_tracked(name)?.0)
    }

    // Also tells whether this call did the load (as opposed to finding it loaded or waiting for someone else's load).
    pub fn load_tracked(&self, name: &str) -> Result<(Arc<ModuleInterface>, /*loaded_now*/ bool)> {
        let pending = {
            let mut slots = self.slots.lock().unwrap();
            match slots.entry(name.to_string()) {
                Entry::Occupied(mut e) => {
                    let waiting_on = match e.get_mut() {
                        Slot::Loaded {module, shared} => {
                            *shared = true;
                            return Ok((module.clone(), false));
                        }
                        Slot::Loading(p) => {
                            p.waiters.fetch_add(1, Ordering::SeqCst);
                            p.clone()
                        }
                    };
                    drop(slots);
                    return waiting_on.wait().map(|m| (m, false));
                }
                Entry::Vacant(e) => {
                    let p = Arc::new(PendingLoad {result: Mutex::new(None), done: Condvar::new(), waiters: AtomicUsize::new(0)});
                    e.insert(Slot::Loading(p.clone()));
                    p
                }
            }
        };

        self.loads_started.fetch_add(1, Ordering::SeqCst);
        let res = {
            let _prof = ProfileScope::with_threshold(0.01, format!("loading module {}", name));
            self.source.load(name).map(Arc::new)
        };
        {
            let mut slots = self.slots.lock().unwrap();
            match &res {
                Ok(m) => {
                    let shared = pending.waiters.load(Ordering::SeqCst) > 0;
                    slots.insert(name.to_string(), Slot::Loaded {module: m.clone(), shared});
                }
                Err(e) => {
                    eprintln!("warning: failed to load module {}: {}", name, e);
                    slots.remove(name);
                }
            }
        }
        pending.finish(res.clone());
        res.map(|m| (m, true))
    }

    // Called by the loader when the request that loaded the module failed. Drops the module unless some other
    // load() already got it, in which case it belongs to that request too and stays.
    // Returns whether it was dropped. Holders of the Arc keep using it; the next load() reloads.
    pub fn forget(&self, name: &str) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(name) {
            Some(Slot::Loaded {shared: false, ..}) => {
                slots.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn list(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap();
        let mut r: Vec<String> = slots.iter().filter(|(_, s)| match s { Slot::Loaded {..} => true, _ => false }).map(|(n, _)| n.clone()).collect();
        r.sort();
        r
    }

    // How many times the source was asked to load something.
    pub fn loads_started(&self) -> usize { self.loads_started.load(Ordering::SeqCst) }
}

#[cfg(test)]
mod tests {
    use crate::{module_registry::*, test_util::*};
    use std::{thread, time::Duration, io::Write, fs};

    #[test]
    fn loads_once() {
        let (source, counter) = CountingSource::new(BuiltinModuleSource);
        let cache = ModuleCache::new(Box::new(source));
        let (a, loaded_now) = cache.load_tracked("std").unwrap();
        assert!(loaded_now);
        let (b, loaded_now) = cache.load_tracked("std").unwrap();
        assert!(!loaded_now);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.list(), vec!["std".to_string()]);
    }

    #[test]
    fn concurrent_loads_share_one_in_flight_load() {
        let (source, counter) = CountingSource::with_delay(BuiltinModuleSource, Duration::from_millis(50));
        let cache = Arc::new(ModuleCache::new(Box::new(source)));
        let threads: Vec<_> = (0..8).map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.load("std").unwrap())
        }).collect();
        let modules: Vec<Arc<ModuleInterface>> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.loads_started(), 1);
        for m in &modules {
            assert!(Arc::ptr_eq(m, &modules[0]));
        }
    }

    #[test]
    fn failures_are_not_cached() {
        let (source, counter) = CountingSource::new(BuiltinModuleSource);
        let cache = ModuleCache::new(Box::new(source));
        assert!(cache.load("boost").unwrap_err().is_loading());
        assert!(cache.load("boost").is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(cache.list().is_empty());
    }

    #[test]
    fn forget_reloads() {
        let (source, counter) = CountingSource::new(BuiltinModuleSource);
        let cache = ModuleCache::new(Box::new(source));
        let (a, loaded_now) = cache.load_tracked("std").unwrap();
        assert!(loaded_now);
        assert!(cache.forget("std"));
        assert!(cache.list().is_empty());
        assert!(!cache.forget("std"));
        let b = cache.load("std").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forget_keeps_shared_modules() {
        let (source, counter) = CountingSource::new(BuiltinModuleSource);
        let cache = ModuleCache::new(Box::new(source));
        assert!(cache.load_tracked("std").unwrap().1);
        assert!(!cache.load_tracked("std").unwrap().1);
        assert!(!cache.forget("std"));
        assert_eq!(cache.list(), vec!["std".to_string()]);
        cache.load("std").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forget_keeps_modules_someone_waited_for() {
        let (source, counter) = CountingSource::with_delay(BuiltinModuleSource, Duration::from_millis(100));
        let cache = Arc::new(ModuleCache::new(Box::new(source)));
        let loader = {
            let cache = cache.clone();
            thread::spawn(move || cache.load_tracked("std").unwrap().1)
        };
        thread::sleep(Duration::from_millis(20));
        let (_, loaded_now) = cache.load_tracked("std").unwrap();
        let loader_loaded = loader.join().unwrap();
        // Whichever thread won the race did the load, the other one shared it.
        assert!(loaded_now != loader_loaded);
        assert!(!cache.forget("std"));
        assert_eq!(cache.list(), vec!["std".to_string()]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn file_source_then_builtin() {
        let dir = std::env::temp_dir().join(format!("nnd-eval-iface-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut f = fs::File::create(dir.join("mylib.iface")).unwrap();
        f.write_all(b"module mylib\nstruct mylib::Point\n  field x int\n  field y int\nend\n").unwrap();
        drop(f);
        fs::write(dir.join("wrong.iface"), "module other\n").unwrap();

        let source = ChainModuleSource {sources: vec![Box::new(FileModuleSource {search_path: vec![PathBuf::from("/nonexistent"), dir.clone()]}), Box::new(BuiltinModuleSource)]};
        let cache = ModuleCache::new(Box::new(source));
        let m = cache.load("mylib").unwrap();
        assert!(m.find("mylib::Point").is_some());
        assert_eq!(cache.load("std").unwrap().name, "std");
        assert!(cache.load("wrong").unwrap_err().is_loading());
        assert!(cache.load("../etc").is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
