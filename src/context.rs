use crate::{*, error::*, log::*, settings::*, symbols::*, module_registry::*, resolver::*, pretty::*, evaluator::*, interp::*};
use std::sync::{Arc, Mutex, RwLock};

// Everything that lives for the duration of a debugging session: settings, the target's debug info, and the caches
// derived from them. Passed explicitly to everything that needs it; there are no global singletons.
pub struct Session {
    settings: RwLock<Settings>,
    symbols: RwLock<Arc<dyn DebugSymbols>>,
    pub modules: ModuleCache,
    pub types: TypeResolver,
    pub formatters: FormatterRegistry,
    pub compiler: Box<dyn Compiler>,
    pub log: Mutex<Log>,
}

impl Session {
    // Module interfaces come from the configured search path, then the bundled std interface.
    // The search path is read once, here.
    pub fn new(settings: Settings, symbols: Arc<dyn DebugSymbols>) -> Self {
        let source = ChainModuleSource {sources: vec![
            Box::new(FileModuleSource {search_path: settings.module_search_path.clone()}),
            Box::new(BuiltinModuleSource)]};
        Self::with_module_source(settings, symbols, Box::new(source))
    }

    pub fn with_module_source(settings: Settings, symbols: Arc<dyn DebugSymbols>, source: Box<dyn ModuleSource>) -> Self {
        Self {
            settings: RwLock::new(settings),
            symbols: RwLock::new(symbols),
            modules: ModuleCache::new(source),
            types: TypeResolver::new(),
            formatters: FormatterRegistry::with_builtin_rules(),
            compiler: Box::new(WatchCompiler),
            log: Mutex::new(Log::new()),
        }
    }

    // Snapshot. Requests use the settings as of their start.
    pub fn settings(&self) -> Settings { self.settings.read().unwrap().clone() }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        if key == "module-search-path" {
            return err!(Usage, "module-search-path can only be set at session start");
        }
        self.settings.write().unwrap().set(key, value)
    }

    pub fn set_import_std_module(&self, enabled: bool) {
        self.settings.write().unwrap().import_std_module = enabled;
    }

    pub fn symbols(&self) -> Arc<dyn DebugSymbols> { self.symbols.read().unwrap().clone() }

    // The target's debug info changed (e.g. the binary was rebuilt). Everything resolved from the old one is dropped.
    // Loaded modules stay, they don't depend on the binary.
    pub fn reload_symbols(&self, symbols: Arc<dyn DebugSymbols>) {
        let dropped = self.types.len();
        *self.symbols.write().unwrap() = symbols;
        self.types.clear();
        log!(self.log.lock().unwrap(), "debug info reloaded, dropped {} cached types", dropped);
    }
}
