// This module implements the address-mode optimizer, two independent passes over selected
// x86-64 graphs.
//
// LEA folding turns Add and Sub nodes into LEA address computations. It recognizes base,
// index, a scale given by a left shift of 1..3, an immediate offset and a symbolic offset,
// normalizes the operand order of additions first and then assimilates operand LEAs as far
// as the components of the two addresses can be combined. Two symbolic offsets or two
// different frame entities never end up in one address. Additions that consume a single-use
// load of the same block are left alone because the address-mode pass can do better with
// them. Finally every load and store whose base is a LEA absorbs that LEA's address; the
// merged memory operation is marked so that it is never merged twice.
//
// Address-mode folding merges loads into the operations consuming them. In destination
// form an operation whose only user is a store to the very address it loaded from becomes
// a single read-modify-write instruction. In source form the operation reads its right
// operand directly from memory. Commutative operations and compares are normalized so that
// the load sits where the instruction can take it, and the swap is undone when nothing was
// folded. A load is only folded if it lives in the same block, has a single user, is at
// least 16 bits wide and neither the other operand nor the load itself depend on the
// operation; the in-block Heights oracle decides the latter.
//
// Both passes only ever improve code. A candidate that does not qualify leaves the graph
// untouched, so disabling either pass never changes program behavior.

use crate::core::session::CompilationSession;
use crate::ir::{pn, BlockId, FrameEntity, Graph, IrOp, Mode, NodeAttr, NodeId, Opcode};
use crate::sched::Heights;

use super::ops::{AddrMode, AmFlavour, MachAttr, OpType, SymOffset, X64Op};

fn is_lea(graph: &Graph, node: NodeId) -> bool {
    graph.is_x64(node, X64Op::Lea)
}

/// LEA computing only a (symbolic or frame) constant.
fn is_offset_only_lea(graph: &Graph, node: NodeId) -> bool {
    is_lea(graph, node) && graph.mach(node).is_some_and(|attr| attr.am.flavour.is_offset_only())
}

/// The load producing `value`, if `value` is the result projection of one.
fn load_of(graph: &Graph, value: NodeId, op: X64Op) -> Option<NodeId> {
    if !graph.is_proj(value) || graph.proj_num(value) != Some(pn::RES) {
        return None;
    }
    let load = graph.skip_proj(value);
    graph.is_x64(load, op).then_some(load)
}

fn single_use_load_in(graph: &Graph, value: NodeId, block: Option<BlockId>) -> bool {
    load_of(graph, value, X64Op::Load)
        .is_some_and(|load| graph.block_of(load) == block && graph.num_users(value) == 1)
}

// -------------------------------------------------------------------------
// LEA folding
// -------------------------------------------------------------------------

/// Components of the address under construction.
#[derive(Debug, Clone)]
struct LeaParts {
    base: NodeId,
    index: NodeId,
    scale: u8,
    offset: i64,
    symbol: Option<SymOffset>,
    frame: Option<FrameEntity>,
}

/// Which components of an operand LEA may be taken over.
#[derive(Debug, Clone, Copy, Default)]
struct Take {
    base: bool,
    index: bool,
    offset: bool,
    scale: bool,
    symbol: bool,
    frame: bool,
}

struct LeaFolder<'g, 's, 'arena> {
    graph: &'g mut Graph,
    session: &'s CompilationSession<'arena>,
    no_reg: NodeId,
}

impl LeaFolder<'_, '_, '_> {
    fn swap_operands(&mut self, node: NodeId) {
        let left = self.graph.operand(node, 2);
        let right = self.graph.operand(node, 3);
        self.graph.set_operand(node, 2, right);
        self.graph.set_operand(node, 3, left);
    }

    /// Neither operand is a single-use load of the same block.
    fn is_addr_candidate(&self, node: NodeId) -> bool {
        let block = self.graph.block_of(node);
        let left = self.graph.operand(node, 2);
        let right = self.graph.operand(node, 3);
        !single_use_load_in(self.graph, left, block)
            && !single_use_load_in(self.graph, right, block)
    }

    /// Decides which parts of the operand `lea` can be merged into `parts`.
    fn take_from(&self, parts: &LeaParts, lea: NodeId) -> Option<Take> {
        let am = &self.graph.mach(lea)?.am;
        let flavour = am.flavour;
        let mut take = Take::default();

        match (parts.frame, am.frame) {
            (Some(a), Some(b)) if a != b => return None,
            (None, Some(_)) => take.frame = true,
            _ => {}
        }
        if parts.symbol.is_some() && am.symbol.is_some() {
            return None;
        }
        take.symbol = am.symbol.is_some();

        let no_base = parts.base == self.no_reg;
        let no_index = parts.index == self.no_reg;
        match (no_base, no_index) {
            (false, false) => {
                // base + offset computation feeding the base slot
                if parts.base != lea || flavour.contains(AmFlavour::INDEX) {
                    return None;
                }
                take.base = true;
                take.offset = flavour.contains(AmFlavour::OFFSET);
            }
            (false, true) => {
                if parts.base == lea {
                    take.base = true;
                    take.index = flavour.contains(AmFlavour::INDEX);
                    take.scale = flavour.contains(AmFlavour::SCALE);
                } else if !flavour.contains(AmFlavour::BASE) {
                    take.index = true;
                    take.scale = flavour.contains(AmFlavour::SCALE);
                } else {
                    return None;
                }
                take.offset = flavour.contains(AmFlavour::OFFSET);
            }
            (true, false) => {
                if parts.index == lea {
                    take.index = true;
                    take.base = flavour.contains(AmFlavour::BASE);
                    take.scale = flavour.contains(AmFlavour::SCALE);
                } else if !flavour.contains(AmFlavour::INDEX) {
                    take.base = true;
                    take.scale = flavour.contains(AmFlavour::SCALE);
                } else {
                    return None;
                }
                take.offset = flavour.contains(AmFlavour::OFFSET);
            }
            (true, true) => return None,
        }
        Some(take)
    }

    /// Tries to turn the Add or Sub `node` into a LEA. Returns the LEA.
    fn fold_addr(&mut self, node: NodeId) -> Option<NodeId> {
        let is_add = self.graph.is_x64(node, X64Op::Add);
        let no_reg = self.no_reg;
        let imm = self.graph.mach(node)?.imm.clone();

        // normalize: offset-only LEA right, other LEAs left, shifts left
        if is_add && self.graph.operand(node, 3) != no_reg {
            if is_offset_only_lea(self.graph, self.graph.operand(node, 2)) {
                self.swap_operands(node);
            }
            let right = self.graph.operand(node, 3);
            if is_lea(self.graph, right) && !is_offset_only_lea(self.graph, right) {
                self.swap_operands(node);
            }
            let (left, right) = (self.graph.operand(node, 2), self.graph.operand(node, 3));
            if !is_lea(self.graph, left) && self.graph.is_x64(right, X64Op::Shl) {
                self.swap_operands(node);
            }
        }

        let left = self.graph.operand(node, 2);
        let mut right = self.graph.operand(node, 3);
        let mut parts = LeaParts {
            base: left,
            index: no_reg,
            scale: 0,
            offset: 0,
            symbol: None,
            frame: None,
        };
        let mut do_lea = false;
        let mut const_offset = 0i64;

        if let Some(imm) = &imm {
            match &imm.symbol {
                Some(name) => {
                    parts.symbol = Some(SymOffset {
                        name: name.clone(),
                        negated: !is_add,
                    });
                }
                None => const_offset = imm.value,
            }
            do_lea = true;
        }

        // constant address operand
        let mut lea_o = None;
        let mut lea_o_offset = 0i64;
        let temp = if right == no_reg { left } else { right };
        let subtrahend = !is_add && temp == right;
        if parts.symbol.is_none() && is_offset_only_lea(self.graph, temp) {
            let am = self.graph.mach(temp)?.am.clone();
            if subtrahend && am.frame.is_some() {
                return None;
            }
            lea_o_offset = if subtrahend { am.offset.checked_neg()? } else { am.offset };
            parts.symbol = am.symbol.map(|s| SymOffset {
                negated: s.negated != subtrahend,
                ..s
            });
            parts.frame = am.frame;
            lea_o = Some(temp);
            do_lea = true;
            if temp == parts.base {
                parts.base = no_reg;
            } else if temp == right {
                right = no_reg;
            }
        }

        let mut shift = None;
        if is_add {
            parts.index = right;
            do_lea = true;

            let temp = if is_lea(self.graph, left) { right } else { left };
            if self.graph.is_x64(temp, X64Op::Shl) {
                let attr = self.graph.mach(temp)?;
                let amount = attr.imm.as_ref().filter(|i| i.symbol.is_none()).map(|i| i.value);
                if let Some(amount @ 0..=3) = amount {
                    if attr.op_type == OpType::Normal {
                        parts.scale = amount as u8;
                        parts.index = self.graph.operand(temp, 2);
                        shift = Some(temp);
                    }
                }
            }

            if parts.index != no_reg && shift.is_some() && !is_lea(self.graph, left) {
                // the shift was the left operand, the right one becomes the base
                parts.base = if Some(right) == lea_o { no_reg } else { right };
            }
        }

        // assimilate a left operand LEA
        let mut assimilated = false;
        if is_lea(self.graph, left) && !is_offset_only_lea(self.graph, left) {
            if let Some(take) = self.take_from(&parts, left) {
                let am = self.graph.mach(left)?.am.clone();
                if take.offset {
                    parts.offset = am.offset;
                }
                if take.symbol {
                    parts.symbol = am.symbol.clone();
                }
                if take.scale {
                    parts.scale = am.scale;
                }
                if take.base {
                    parts.base = self.graph.operand(left, 0);
                }
                if take.index {
                    parts.index = self.graph.operand(left, 1);
                }
                if take.frame {
                    parts.frame = am.frame;
                }
                assimilated = true;
            } else {
                log::trace!("keeping {} as operand of new LEA", left);
            }
        }

        if !do_lea {
            return None;
        }

        let const_offset = if is_add { const_offset } else { const_offset.checked_neg()? };
        parts.offset = parts.offset.checked_add(const_offset)?.checked_add(lea_o_offset)?;
        if i32::try_from(parts.offset).is_err() {
            return None;
        }

        // frame addresses are relative to the frame pointer, which occupies the base
        if parts.frame.is_some() && parts.base != no_reg {
            if parts.index != no_reg {
                return None;
            }
            parts.index = parts.base;
            parts.base = no_reg;
            parts.scale = 0;
        }

        let mut flavour = AmFlavour::NONE;
        if parts.offset != 0 || parts.symbol.is_some() || parts.frame.is_some() {
            flavour |= AmFlavour::OFFSET;
        }
        if parts.base != no_reg {
            flavour |= AmFlavour::BASE;
        }
        if parts.index != no_reg {
            flavour |= AmFlavour::INDEX;
        }
        if parts.scale > 0 {
            flavour |= AmFlavour::SCALE;
        }
        if flavour == AmFlavour::NONE {
            return None;
        }

        let mode = self.graph.mode(node);
        let block = self.graph.block_of(node);
        let attr = MachAttr {
            am: AddrMode {
                scale: parts.scale,
                offset: parts.offset,
                symbol: parts.symbol,
                frame: parts.frame,
                flavour,
            },
            ..MachAttr::default()
        };
        let lea = self.graph.add_node(
            Opcode::X64(X64Op::Lea),
            mode,
            block,
            vec![parts.base, parts.index],
            NodeAttr::Machine(Box::new(attr)),
        );
        log::trace!(
            "LEA folded: {} -> {} [{}] (shift {:?}, lea {:?})",
            node,
            lea,
            flavour,
            shift,
            lea_o
        );
        self.session.record_lea_created();
        if assimilated {
            self.session.record_lea_assimilated();
        }
        self.graph.exchange(node, lea);
        Some(lea)
    }

    /// Merges the LEA feeding the base of the load or store `node` into its address.
    fn merge_loadstore_lea(&mut self, node: NodeId) {
        let base = self.graph.operand(node, 0);
        if !is_lea(self.graph, base) || self.graph.operand(node, 1) != self.no_reg {
            return;
        }
        let (Some(attr), Some(lea_attr)) = (self.graph.mach(node), self.graph.mach(base)) else {
            return;
        };
        if attr.got_lea {
            return;
        }
        let (am, lea_am) = (&attr.am, &lea_attr.am);
        if am.frame.is_some() && lea_am.frame.is_some() && am.frame != lea_am.frame {
            return;
        }
        if am.symbol.is_some() && lea_am.symbol.is_some() {
            return;
        }
        let Some(offset) = am.offset.checked_add(lea_am.offset) else {
            return;
        };
        if i32::try_from(offset).is_err() {
            return;
        }
        let merged = AddrMode {
            scale: lea_am.scale,
            offset,
            symbol: lea_am.symbol.clone().or_else(|| am.symbol.clone()),
            frame: lea_am.frame.or(am.frame),
            flavour: if offset != 0 || am.symbol.is_some() || am.frame.is_some() {
                lea_am.flavour | AmFlavour::OFFSET
            } else {
                lea_am.flavour
            },
        };
        let (lea_base, lea_index) = (self.graph.operand(base, 0), self.graph.operand(base, 1));
        if merged.frame.is_some() && lea_base != self.no_reg {
            return;
        }

        if let Some(attr) = self.graph.mach_mut(node) {
            attr.am = merged;
            attr.got_lea = true;
        }
        self.graph.set_operand(node, 0, lea_base);
        self.graph.set_operand(node, 1, lea_index);
        log::trace!("merged LEA {} into {}", base, node);
        self.session.record_lea_merged_into_memop();
    }

    fn visit(&mut self, node: NodeId) {
        if !self.graph.is_live(node) {
            return;
        }
        let Some(op) = self.graph.x64_op(node) else {
            return;
        };
        match op {
            X64Op::Add | X64Op::Sub => {
                let mode = self.graph.mode(node);
                let normal = self.graph.mach(node).is_some_and(|a| a.op_type == OpType::Normal);
                if normal
                    && mode.is_int_like()
                    && mode.bits() >= 32
                    && self.is_addr_candidate(node)
                {
                    self.fold_addr(node);
                }
            }
            op if (op.is_load() || op.is_store()) && op != X64Op::Fild && op != X64Op::Fist => {
                self.merge_loadstore_lea(node);
            }
            _ => {}
        }
    }
}

/// Folds address arithmetic into LEAs and LEAs into load/store addresses.
pub fn fold_leas(graph: &mut Graph, session: &CompilationSession<'_>) {
    log::debug!("folding LEAs in {}", graph.name());
    let order = graph.walk_postorder();
    let no_reg = graph.no_reg();
    let mut folder = LeaFolder {
        graph,
        session,
        no_reg,
    };
    for node in order {
        folder.visit(node);
    }
}

// -------------------------------------------------------------------------
// Address-mode folding
// -------------------------------------------------------------------------

struct AmFolder<'g, 's, 'arena> {
    graph: &'g mut Graph,
    session: &'s CompilationSession<'arena>,
    heights: Heights,
    no_reg: NodeId,
}

/// Swaps to normalize operands; compares invert their relation through `ins_permuted`.
fn is_swappable(op: X64Op) -> bool {
    op.is_commutative() || matches!(op, X64Op::Cmp | X64Op::XCmp)
}

fn load_op_for(op: X64Op) -> X64Op {
    match op {
        X64Op::XAdd
        | X64Op::XSub
        | X64Op::XMul
        | X64Op::XDiv
        | X64Op::XXor
        | X64Op::XAnd
        | X64Op::XCmp
        | X64Op::Cvtts2si
        | X64Op::XConv => X64Op::XLoad,
        _ => X64Op::Load,
    }
}

impl AmFolder<'_, '_, '_> {
    fn ls_mode(&self, node: NodeId) -> Option<Mode> {
        self.graph.mach(node).and_then(|a| a.ls_mode)
    }

    fn swap(&mut self, node: NodeId) {
        let left = self.graph.operand(node, 2);
        let right = self.graph.operand(node, 3);
        self.graph.set_operand(node, 2, right);
        self.graph.set_operand(node, 3, left);
        if matches!(self.graph.x64_op(node), Some(X64Op::Cmp | X64Op::XCmp)) {
            if let Some(attr) = self.graph.mach_mut(node) {
                attr.ins_permuted = !attr.ins_permuted;
            }
        }
    }

    /// Whether the operand `value` of `node` is a load that can be folded into it.
    fn is_am_load(&self, node: NodeId, value: NodeId, other: NodeId) -> Option<NodeId> {
        let op = self.graph.x64_op(node)?;
        let load = load_of(self.graph, value, load_op_for(op))?;
        let block = self.graph.block_of(node);
        if self.graph.block_of(load) != block || self.graph.num_users(value) != 1 {
            return None;
        }
        if self.ls_mode(load).map_or(0, |m| m.bits()) < 16 {
            return None;
        }
        if other != self.no_reg && self.graph.block_of(other) == block {
            let other = self.graph.skip_proj(other);
            if self.heights.reachable_in_block(self.graph, other, load) {
                return None;
            }
        }
        if self.heights.reachable_in_block(self.graph, load, node) {
            return None;
        }
        Some(load)
    }

    /// Load widths an operation can read in place of its operand.
    fn width_matches(&self, node: NodeId, load: NodeId) -> bool {
        let Some(op) = self.graph.x64_op(node) else {
            return false;
        };
        let load_bits = self.ls_mode(load).map_or(0, |m| m.bits());
        let attr = self.graph.mach(node);
        let expected = match op {
            X64Op::Conv | X64Op::Cvtsi2s | X64Op::Cvtts2si | X64Op::XConv => {
                attr.and_then(|a| a.src_mode)
            }
            _ => attr.and_then(|a| a.ls_mode),
        };
        expected.is_some_and(|m| m.bits() == load_bits)
    }

    /// Address of `store` equals the address `load` reads.
    fn same_address(&self, load: NodeId, store: NodeId) -> bool {
        let (Some(la), Some(sa)) = (self.graph.mach(load), self.graph.mach(store)) else {
            return false;
        };
        self.graph.operand(load, 0) == self.graph.operand(store, 0)
            && self.graph.operand(load, 1) == self.graph.operand(store, 1)
            && la.am.same_components(&sa.am)
            && la.ls_mode == sa.ls_mode
    }

    /// The store consuming the result of `node`, if it is the single user.
    fn single_store_user(&self, node: NodeId) -> Option<NodeId> {
        let users = self.graph.users(node);
        if users.len() != 1 || users[0].pos != 2 {
            return None;
        }
        let store = users[0].user;
        let same_block = self.graph.block_of(store) == self.graph.block_of(node);
        (self.graph.is_x64(store, X64Op::Store) && same_block).then_some(store)
    }

    fn copy_address(&mut self, node: NodeId, from: NodeId, op_type: OpType) {
        let base = self.graph.operand(from, 0);
        let index = self.graph.operand(from, 1);
        let Some(src) = self.graph.mach(from).cloned() else {
            return;
        };
        if let Some(attr) = self.graph.mach_mut(node) {
            attr.am = src.am;
            attr.ls_mode = src.ls_mode;
            attr.op_type = op_type;
        }
        self.graph.set_operand(node, 0, base);
        self.graph.set_operand(node, 1, index);
    }

    fn remove_load(&mut self, load: NodeId) {
        let mem_in = self.graph.operand(load, 2);
        if let Some(mem_proj) = self.graph.find_proj(load, pn::MEM) {
            self.graph.exchange(mem_proj, mem_in);
        }
        if let Some(res) = self.graph.find_proj(load, pn::RES) {
            self.graph.kill(res);
        }
        self.graph.kill(load);
    }

    /// Load, operation and store into one read-modify-write instruction.
    fn try_dest_am(&mut self, node: NodeId, load: NodeId) -> bool {
        let Some(store) = self.single_store_user(node) else {
            return false;
        };
        if !self.same_address(load, store) {
            return false;
        }
        let store_mem = self.graph.operand(store, 3);
        let load_mem = self.graph.operand(load, 2);
        let load_mem_proj = self.graph.find_proj(load, pn::MEM);
        if store_mem != load_mem && Some(store_mem) != load_mem_proj {
            return false;
        }

        let mem_pos = self.graph.arity(node) - 1;
        self.copy_address(node, load, OpType::AmDest);
        self.graph.set_operand(node, 2, self.no_reg);
        self.graph.set_operand(node, mem_pos, load_mem);
        self.graph.set_mode(node, Mode::Mem);
        self.graph.exchange(store, node);
        self.remove_load(load);
        log::trace!("dest AM: {} absorbed load {} and store {}", node, load, store);
        self.session.record_dest_am();
        true
    }

    /// Operation reading its operand at `pos` from the address of `load`.
    fn do_source_am(&mut self, node: NodeId, load: NodeId, pos: usize) {
        let mem_pos = self.graph.arity(node) - 1;
        let load_mem = self.graph.operand(load, 2);
        self.copy_address(node, load, OpType::AmSource);
        self.graph.set_operand(node, pos, self.no_reg);
        self.graph.set_operand(node, mem_pos, load_mem);

        if let Some(mem_proj) = self.graph.find_proj(load, pn::MEM) {
            if self.graph.num_users(mem_proj) > 0 {
                // the value becomes a projection so the memory can be carried over
                let mode = self.graph.mode(node);
                let block = self.graph.block_of(node);
                let users: Vec<_> = self.graph.users(node).to_vec();
                self.graph.set_mode(node, Mode::Tuple);
                let res = self.graph.add_node(
                    Opcode::Ir(IrOp::Proj),
                    mode,
                    block,
                    vec![node],
                    NodeAttr::Proj(pn::RES),
                );
                for u in users {
                    self.graph.set_operand(u.user, u.pos as usize, res);
                }
                self.graph.set_operand(mem_proj, 0, node);
            }
        }
        if let Some(res) = self.graph.find_proj(load, pn::RES) {
            self.graph.kill(res);
        }
        if self.graph.users(load).is_empty() {
            self.graph.kill(load);
        }
        log::trace!("source AM: {} reads load {}", node, load);
        self.session.record_source_am();
    }

    fn visit(&mut self, node: NodeId) -> bool {
        if !self.graph.is_live(node) {
            return false;
        }
        let Some(op) = self.graph.x64_op(node) else {
            return false;
        };
        let support = op.am_support();
        if support == super::ops::AmSupport::None
            || op == X64Op::Lea
            || op.is_load()
            || op.is_store()
        {
            return false;
        }
        let Some(attr) = self.graph.mach(node) else {
            return false;
        };
        if attr.op_type != OpType::Normal || attr.am.frame.is_some() {
            return false;
        }
        let has_imm = attr.imm.is_some();

        if op.is_unop() {
            let value = self.graph.operand(node, 2);
            let Some(load) = self.is_am_load(node, value, self.no_reg) else {
                return false;
            };
            if support.dest() && self.try_dest_am(node, load) {
                return true;
            }
            if support.source() && self.width_matches(node, load) {
                self.do_source_am(node, load, 2);
                return true;
            }
            return false;
        }
        if !op.is_binop() {
            return false;
        }

        let left = self.graph.operand(node, 2);
        let right = self.graph.operand(node, 3);
        let left_load = self.is_am_load(node, left, right);
        let right_load = if right == self.no_reg {
            None
        } else {
            self.is_am_load(node, right, left)
        };
        if left_load.is_none() && right_load.is_none() {
            return false;
        }
        let swappable = is_swappable(op) && right != self.no_reg;

        // destination form needs the load on the left
        if support.dest() {
            let mut swapped = false;
            let mut candidate = left_load;
            if swappable {
                let prefer_right = match (left_load, right_load, self.single_store_user(node)) {
                    (None, Some(_), _) => true,
                    (Some(l), Some(r), Some(store)) => {
                        !self.same_address(l, store) && self.same_address(r, store)
                    }
                    _ => false,
                };
                if prefer_right {
                    self.swap(node);
                    swapped = true;
                    candidate = right_load;
                }
            }
            if let Some(load) = candidate {
                if self.try_dest_am(node, load) {
                    return true;
                }
            }
            if swapped {
                self.swap(node);
            }
        }

        // source form needs the load on the right
        if !support.source() || has_imm {
            return false;
        }
        let mut swapped = false;
        let mut candidate = right_load;
        if candidate.is_none() && swappable {
            self.swap(node);
            swapped = true;
            candidate = left_load;
        }
        if let Some(load) = candidate.filter(|&l| self.width_matches(node, l)) {
            self.do_source_am(node, load, 3);
            return true;
        }
        if swapped {
            self.swap(node);
        }
        false
    }
}

/// Folds loads (and matching stores) into the operations that consume them.
pub fn fold_address_modes(graph: &mut Graph, session: &CompilationSession<'_>) {
    log::debug!("folding address modes in {}", graph.name());
    let order = graph.walk_postorder();
    let heights = Heights::compute(graph);
    let no_reg = graph.no_reg();
    let mut folder = AmFolder {
        graph,
        session,
        heights,
        no_reg,
    };
    for node in order {
        if folder.visit(node) {
            if let Some(block) = folder.graph.block_of(node) {
                folder.heights.recompute_block(folder.graph, block);
            }
        }
    }
}
