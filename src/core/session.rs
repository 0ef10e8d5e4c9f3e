// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession is the compilation context shared by all passes of one compiler run:
// it owns the arena, interns strings, hands out unique labels, and owns the lazily populated
// caches of synthesized constant entities. Float sign and absolute-value masks are memoized
// per (kind, width) and float literals per bit pattern; both caches live here instead of in
// process-wide statics so that repeated compilations in one process (and tests) stay
// isolated. The session also collects SessionStats: functions compiled, nodes selected per
// opcode, address-mode folding counts, inserted keep-alives and scheduling volume.

//! Arena-based compilation session management.

use bumpalo::Bump;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

/// Kind of a synthesized float mask constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownConst {
    /// Only the sign bit set, used to negate.
    SignMask,
    /// Everything but the sign bit set, used for absolute values.
    AbsMask,
}

/// Read-only data entity created during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstEntity<'arena> {
    pub name: &'arena str,
    /// Bit pattern of one element.
    pub bits: u64,
    /// Element size in bytes (4 or 8).
    pub size: u32,
    /// Number of elements, masks are widened to a full 16-byte vector.
    pub count: u32,
}

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    stats: RefCell<SessionStats>,

    interned_strings: RefCell<HashMap<String, &'arena str>>,

    known_consts: RefCell<hashbrown::HashMap<(KnownConst, u32), &'arena str>>,

    float_pool: RefCell<hashbrown::HashMap<(u64, u32), &'arena str>>,

    /// Entities in creation order, for emission.
    constants: RefCell<Vec<ConstEntity<'arena>>>,

    next_label: Cell<u32>,

    current_function: RefCell<Option<String>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            known_consts: RefCell::new(hashbrown::HashMap::new()),
            float_pool: RefCell::new(hashbrown::HashMap::new()),
            constants: RefCell::new(Vec::new()),
            next_label: Cell::new(0),
            current_function: RefCell::new(None),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    pub fn set_current_function(&self, name: &str) {
        *self.current_function.borrow_mut() = Some(name.to_string());
    }

    pub fn current_function(&self) -> Option<String> {
        self.current_function.borrow().clone()
    }

    /// Fresh local label `.L<prefix><n>`, unique within the session.
    pub fn unique_label(&self, prefix: &str) -> &'arena str {
        let n = self.next_label.get();
        self.next_label.set(n + 1);
        self.intern_str(&format!(".L{}{}", prefix, n))
    }

    fn add_constant(&self, prefix: &str, bits: u64, size: u32, count: u32) -> &'arena str {
        let name = self.unique_label(prefix);
        self.constants.borrow_mut().push(ConstEntity {
            name,
            bits,
            size,
            count,
        });
        name
    }

    /// Entity holding the mask `kind` for floats of `bits` width, created on first use.
    pub fn known_const(&self, kind: KnownConst, bits: u32) -> &'arena str {
        if let Some(&name) = self.known_consts.borrow().get(&(kind, bits)) {
            return name;
        }
        let (pattern, size) = match (kind, bits) {
            (KnownConst::SignMask, 32) => (0x8000_0000u64, 4),
            (KnownConst::AbsMask, 32) => (0x7fff_ffffu64, 4),
            (KnownConst::SignMask, _) => (0x8000_0000_0000_0000u64, 8),
            (KnownConst::AbsMask, _) => (0x7fff_ffff_ffff_ffffu64, 8),
        };
        let prefix = match kind {
            KnownConst::SignMask => "sign",
            KnownConst::AbsMask => "abs",
        };
        let name = self.add_constant(prefix, pattern, size, 16 / size);
        self.known_consts.borrow_mut().insert((kind, bits), name);
        log::trace!("created {:?} entity {} for {}-bit floats", kind, name, bits);
        name
    }

    /// Pool entity holding the float literal `value` at `bits` width.
    pub fn float_const(&self, value: f64, bits: u32) -> &'arena str {
        let pattern = if bits == 32 {
            u64::from((value as f32).to_bits())
        } else {
            value.to_bits()
        };
        if let Some(&name) = self.float_pool.borrow().get(&(pattern, bits)) {
            return name;
        }
        let name = self.add_constant("fp", pattern, bits / 8, 1);
        self.float_pool.borrow_mut().insert((pattern, bits), name);
        name
    }

    /// All constant entities created so far, in creation order.
    pub fn constants(&self) -> Vec<ConstEntity<'arena>> {
        self.constants.borrow().clone()
    }

    pub fn record_function_compiled(&self, name: &str, asm_lines: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.asm_lines += asm_lines;
        if stats.largest_function_lines < asm_lines {
            stats.largest_function_lines = asm_lines;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record a target node created by instruction selection.
    pub fn record_node_selected(&self, opcode: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.nodes_selected += 1;
        *stats.instruction_counts.entry(opcode.to_string()).or_insert(0) += 1;
    }

    pub fn record_keep_inserted(&self) {
        self.stats.borrow_mut().keeps_inserted += 1;
    }

    pub fn record_lea_created(&self) {
        self.stats.borrow_mut().leas_created += 1;
    }

    pub fn record_lea_assimilated(&self) {
        self.stats.borrow_mut().leas_assimilated += 1;
    }

    pub fn record_lea_merged_into_memop(&self) {
        self.stats.borrow_mut().leas_merged += 1;
    }

    pub fn record_source_am(&self) {
        self.stats.borrow_mut().source_am_folds += 1;
    }

    pub fn record_dest_am(&self) {
        self.stats.borrow_mut().dest_am_folds += 1;
    }

    pub fn record_block_scheduled(&self, nodes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.blocks_scheduled += 1;
        stats.nodes_scheduled += nodes;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions_compiled: usize,

    /// Target nodes created by instruction selection.
    pub nodes_selected: usize,

    /// Count of each target opcode selected.
    pub instruction_counts: HashMap<String, usize>,

    pub keeps_inserted: usize,

    /// Add/Sub nodes turned into LEAs.
    pub leas_created: usize,

    /// LEA operands absorbed into another LEA.
    pub leas_assimilated: usize,

    /// LEAs absorbed into the address of a load or store.
    pub leas_merged: usize,

    pub source_am_folds: usize,

    pub dest_am_folds: usize,

    pub blocks_scheduled: usize,

    pub nodes_scheduled: usize,

    /// Assembly lines emitted.
    pub asm_lines: usize,

    pub largest_function_lines: usize,

    pub largest_function_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Nodes selected: {}", self.nodes_selected)?;
        writeln!(f, "  Keep-alives inserted: {}", self.keeps_inserted)?;
        writeln!(
            f,
            "  LEAs: {} created, {} assimilated, {} merged into memory operands",
            self.leas_created, self.leas_assimilated, self.leas_merged
        )?;
        writeln!(
            f,
            "  Address modes: {} source, {} destination",
            self.source_am_folds, self.dest_am_folds
        )?;
        writeln!(
            f,
            "  Scheduled: {} nodes in {} blocks",
            self.nodes_scheduled, self.blocks_scheduled
        )?;
        writeln!(f, "  Assembly lines: {}", self.asm_lines)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} lines)",
                self.largest_function_name, self.largest_function_lines
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("hello");
        let s2 = session.intern_str("hello");
        let s3 = session.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_known_consts_are_memoized_per_kind_and_width() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let sign64 = session.known_const(KnownConst::SignMask, 64);
        let again = session.known_const(KnownConst::SignMask, 64);
        let sign32 = session.known_const(KnownConst::SignMask, 32);
        let abs64 = session.known_const(KnownConst::AbsMask, 64);

        assert_eq!(sign64, again);
        assert_ne!(sign64, sign32);
        assert_ne!(sign64, abs64);

        let constants = session.constants();
        assert_eq!(constants.len(), 3);
        assert_eq!(constants[0].bits, 0x8000_0000_0000_0000);
        assert_eq!(constants[1].count, 4);
    }

    #[test]
    fn test_sessions_do_not_share_caches() {
        let arena = Bump::new();
        let first = CompilationSession::new(&arena);
        let second = CompilationSession::new(&arena);

        first.known_const(KnownConst::AbsMask, 32);
        assert!(second.constants().is_empty());
    }

    #[test]
    fn test_float_pool() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let a = session.float_const(1.5, 64);
        let b = session.float_const(1.5, 64);
        let c = session.float_const(1.5, 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(session.constants()[1].bits, u64::from(1.5f32.to_bits()));
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_function_compiled("factorial", 12);
        session.record_node_selected("Add");
        session.record_node_selected("Add");
        session.record_dest_am();

        let stats = session.stats();
        assert_eq!(stats.instruction_counts["Add"], 2);

        let output = format!("{}", stats);
        assert!(output.contains("Functions compiled: 1"));
        assert!(output.contains("Nodes selected: 2"));
        assert!(output.contains("0 source, 1 destination"));
        assert!(output.contains("factorial (12 lines)"));
    }
}
