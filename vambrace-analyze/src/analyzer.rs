use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use vambrace_macho::raw::{N_EXT, N_SECT, N_STAB, N_TYPE, N_UNDF};
use vambrace_macho::{MachoBinary, MachoError};
use vambrace_objc::{ObjcClassLike, ObjcMethodInfo, ObjcProtocol, ObjcRuntimeData};

use crate::function::FunctionAnalyzer;
use crate::instruction::InstructionDecoder;

/// Process-wide analyzer cache, keyed by slice identity. Analyzers are never
/// evicted; the expectation is tool-session usage.
static ANALYZER_CACHE: Lazy<Mutex<HashMap<(PathBuf, u64), Arc<MachoAnalyzer>>>> =
    Lazy::new(Default::default);

/// Analysis state for one Mach-O slice.
///
/// Construction eagerly resolves the slice's Objective-C metadata and symbol
/// classification; per-function views are built lazily and cached for the
/// analyzer's lifetime. Obtain instances through
/// [`MachoAnalyzer::get_analyzer`], which memoizes per `(path, FAT offset)`
/// so repeated retrieval returns the same instance.
pub struct MachoAnalyzer {
    binary: Arc<MachoBinary>,
    decoder: Arc<dyn InstructionDecoder>,
    objc: Arc<ObjcRuntimeData>,
    imported_symbols: Vec<String>,
    exported_symbols: Vec<String>,
    function_boundaries: Vec<u64>,
    function_cache: Mutex<HashMap<u64, Arc<FunctionAnalyzer>>>,
}

impl MachoAnalyzer {
    /// Returns the process-wide analyzer for this slice, constructing it on
    /// first retrieval.
    pub fn get_analyzer(
        binary: Arc<MachoBinary>,
        decoder: Arc<dyn InstructionDecoder>,
    ) -> Arc<MachoAnalyzer> {
        let key = (binary.path().to_owned(), binary.fat_offset());
        let mut cache = ANALYZER_CACHE.lock();
        if let Some(existing) = cache.get(&key) {
            return Arc::clone(existing);
        }
        let analyzer = Arc::new(MachoAnalyzer::new(binary, decoder));
        cache.insert(key, Arc::clone(&analyzer));
        analyzer
    }

    fn new(binary: Arc<MachoBinary>, decoder: Arc<dyn InstructionDecoder>) -> Self {
        let objc = Arc::new(ObjcRuntimeData::parse(&binary));

        let mut imported_symbols = Vec::new();
        let mut exported_symbols = Vec::new();
        for nlist in binary.symtab_contents() {
            if nlist.n_type & N_STAB != 0 {
                continue;
            }
            let name = match binary.symbol_name(nlist) {
                Ok(name) => name,
                Err(err) => {
                    debug!(error = %err, "skipping symbol with unreadable name");
                    continue;
                }
            };
            match nlist.n_type & N_TYPE {
                N_UNDF => imported_symbols.push(name),
                N_SECT if nlist.n_type & N_EXT != 0 => exported_symbols.push(name),
                _ => {}
            }
        }

        let function_boundaries = collect_function_boundaries(&binary, &objc);

        MachoAnalyzer {
            binary,
            decoder,
            objc,
            imported_symbols,
            exported_symbols,
            function_boundaries,
            function_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The parsed slice this analyzer works over.
    pub fn binary(&self) -> &Arc<MachoBinary> {
        &self.binary
    }

    /// The resolved Objective-C metadata of the slice.
    pub fn objc(&self) -> &ObjcRuntimeData {
        &self.objc
    }

    /// Names of all undefined (imported) symbols.
    pub fn imported_symbols(&self) -> &[String] {
        &self.imported_symbols
    }

    /// Names of all externally visible defined symbols.
    pub fn exported_symbols(&self) -> &[String] {
        &self.exported_symbols
    }

    /// Map of imported symbol name to its `__stubs` trampoline address.
    pub fn imported_symbol_names_to_pointers(&self) -> &HashMap<String, u64> {
        self.objc.imported_symbol_names_to_pointers()
    }

    /// Map of imported symbol name to the branch destination a call to it
    /// uses (the stub trampoline).
    pub fn external_symbol_names_to_branch_destinations(&self) -> &HashMap<String, u64> {
        self.objc.imported_symbol_names_to_pointers()
    }

    /// Map of `__stubs` trampoline address back to the imported symbol name.
    pub fn branch_destinations_to_symbol_names(&self) -> &HashMap<u64, String> {
        self.objc.branch_destinations_to_symbol_names()
    }

    /// The install path of the dylib supplying an imported symbol.
    pub fn path_for_external_symbol(&self, name: &str) -> Option<&str> {
        self.objc.path_for_external_symbol(name)
    }

    /// The classes and categories of the image, in section order.
    pub fn objc_classes(&self) -> &[ObjcClassLike] {
        self.objc.classes()
    }

    /// Every protocol conformed to within the image, deduplicated by name.
    pub fn get_conformed_protocols(&self) -> &[ObjcProtocol] {
        self.objc.protocols()
    }

    /// Every Objective-C method of the image, flattened.
    pub fn get_objc_methods(&self) -> Vec<ObjcMethodInfo> {
        self.objc.methods()
    }

    /// Function views for every implementation of the named selector.
    pub fn get_imps_for_sel(&self, selector_name: &str) -> Vec<Arc<FunctionAnalyzer>> {
        self.objc
            .imps_for_selector(selector_name)
            .into_iter()
            .filter_map(|imp| match self.get_function_analyzer(imp) {
                Ok(function) => Some(function),
                Err(err) => {
                    debug!(imp, error = %err, "skipping unanalyzable implementation");
                    None
                }
            })
            .collect()
    }

    /// The per-function view for the function entered at `entry_address`,
    /// building and caching it on first use.
    pub fn get_function_analyzer(
        &self,
        entry_address: u64,
    ) -> Result<Arc<FunctionAnalyzer>, MachoError> {
        if let Some(cached) = self.function_cache.lock().get(&entry_address) {
            return Ok(Arc::clone(cached));
        }

        let end = self.function_end_address(entry_address);
        let offset = self.binary.file_offset_for_virtual_address(entry_address)?;
        let code = self.binary.bytes(offset, end.saturating_sub(entry_address))?;
        let instructions = self.decoder.decode(code, entry_address);

        let function = Arc::new(FunctionAnalyzer::new(
            entry_address,
            instructions,
            Arc::clone(&self.binary),
            Arc::clone(&self.objc),
            Arc::clone(&self.decoder),
        ));
        self.function_cache
            .lock()
            .insert(entry_address, Arc::clone(&function));
        Ok(function)
    }

    /// Where the function entered at `entry_address` ends: the next known
    /// entry point, or the end of `__text`.
    fn function_end_address(&self, entry_address: u64) -> u64 {
        let text_end = self
            .binary
            .section_named("__text")
            .map(|section| section.end_address)
            .unwrap_or(entry_address);

        self.function_boundaries
            .iter()
            .copied()
            .find(|&boundary| boundary > entry_address)
            .unwrap_or(text_end)
            .clamp(entry_address, text_end.max(entry_address))
    }
}

impl fmt::Debug for MachoAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachoAnalyzer")
            .field("binary", &self.binary)
            .field("imported_symbols", &self.imported_symbols.len())
            .field("exported_symbols", &self.exported_symbols.len())
            .finish()
    }
}

/// Collects every known function entry point in `__text`: Objective-C method
/// implementations plus defined symbol values. Sorted and deduplicated, these
/// bound function extents.
fn collect_function_boundaries(binary: &MachoBinary, objc: &ObjcRuntimeData) -> Vec<u64> {
    let (text_start, text_end) = match binary.section_named("__text") {
        Some(section) => (section.address, section.end_address),
        None => return Vec::new(),
    };

    let mut boundaries: Vec<u64> = Vec::new();
    for method in objc.methods() {
        if let Some(imp) = method.selector.implementation {
            boundaries.push(imp);
        }
    }
    for nlist in binary.symtab_contents() {
        if nlist.n_type & N_STAB == 0 && nlist.n_type & N_TYPE == N_SECT {
            boundaries.push(nlist.n_value);
        }
    }

    boundaries.retain(|&address| text_start <= address && address < text_end);
    boundaries.sort_unstable();
    boundaries.dedup();
    boundaries
}
