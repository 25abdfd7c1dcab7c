//! The changes stack: one frame per active subtransaction depth.
//!
//! Each frame records which packages and which variables were first
//! touched at that nesting level, which is what makes the
//! touched-at-current-level test cheap for every later mutation. The
//! frame owns an arena region charged with its list nodes.

use crate::arena::{Arena, RegionId};
use crate::package::Package;
use crate::transaction::savepoint;
use crate::types::{Name, NestLevel};
use crate::variable::Variable;
use std::mem;

/// One frame of the changes stack.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) region: RegionId,
    /// Packages first touched at this level, in touch order.
    pub(crate) packs: Vec<Name>,
    /// Variables first touched at this level, as (package, variable).
    pub(crate) vars: Vec<(Name, Name)>,
}

/// The changes stack itself. Present only while some transaction level
/// has recorded changes; the last frame is the current level's.
#[derive(Debug)]
pub(crate) struct ChangesStack {
    pub(crate) region: RegionId,
    pub(crate) frames: Vec<Frame>,
}

impl ChangesStack {
    /// Number of frames, which equals the nesting depth covered.
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    fn push_frame(&mut self, arena: &mut Arena) {
        let region = arena.create_region(Some(self.region));
        self.frames.push(Frame {
            region,
            packs: Vec::new(),
            vars: Vec::new(),
        });
    }
}

fn name_cost(name: &Name) -> u64 {
    mem::size_of::<Name>() as u64 + name.as_str().len() as u64
}

/// Appends a package entry to a frame, charging its region.
pub(crate) fn push_pack_entry(frame: &mut Frame, arena: &mut Arena, name: &Name) {
    arena.charge(frame.region, name_cost(name));
    frame.packs.push(name.clone());
}

/// Appends a variable entry to a frame, charging its region.
pub(crate) fn push_var_entry(frame: &mut Frame, arena: &mut Arena, pkg_name: &Name, var_name: &Name) {
    arena.charge(frame.region, name_cost(pkg_name) + name_cost(var_name));
    frame.vars.push((pkg_name.clone(), var_name.clone()));
}

/// Builds the stack up to the current nesting depth if it is absent.
///
/// Intermediate frames are created lazily: a mutation at level 3 with
/// no stack yet gets frames for levels 1..=3 in one go.
pub(crate) fn prepare(
    changes: &mut Option<ChangesStack>,
    arena: &mut Arena,
    module_region: RegionId,
    nest: NestLevel,
) {
    if changes.is_none() {
        let region = arena.create_region(Some(module_region));
        let mut stack = ChangesStack {
            region,
            frames: Vec::new(),
        };
        for _ in 0..nest.as_u32() {
            stack.push_frame(arena);
        }
        *changes = Some(stack);
    }
}

/// Pushes a frame for a freshly started subtransaction. No-op while the
/// stack is absent; `prepare` will backfill frames on the next touch.
pub(crate) fn push_frame(changes: &mut Option<ChangesStack>, arena: &mut Arena) {
    if let Some(stack) = changes.as_mut() {
        stack.push_frame(arena);
    }
}

/// Links a package into the current frame unless it is already there,
/// and stamps its head state with the current level.
pub(crate) fn add_to_changed_packs(
    changes: &mut Option<ChangesStack>,
    arena: &mut Arena,
    module_region: RegionId,
    pkg: &mut Package,
    nest: NestLevel,
) {
    prepare(changes, arena, module_region, nest);
    if savepoint::pack_changed_in_current(changes, pkg, nest) {
        return;
    }
    let Some(frame) = changes.as_mut().and_then(|s| s.frames.last_mut()) else {
        return;
    };
    push_pack_entry(frame, arena, &pkg.name);
    if let Some(head) = pkg.head_mut() {
        head.level = nest;
    }
}

/// Links a variable into the current frame unless it is already there,
/// and stamps its head state with the current level.
pub(crate) fn add_to_changed_vars(
    changes: &mut Option<ChangesStack>,
    arena: &mut Arena,
    module_region: RegionId,
    pkg_name: &Name,
    var: &mut Variable,
    nest: NestLevel,
) {
    prepare(changes, arena, module_region, nest);
    if savepoint::var_changed_in_current(changes, var, nest) {
        return;
    }
    let Some(frame) = changes.as_mut().and_then(|s| s.frames.last_mut()) else {
        return;
    };
    let var_name = var.name.clone();
    push_var_entry(frame, arena, pkg_name, &var_name);
    if let Some(head) = var.head_mut() {
        head.level = nest;
    }
}

/// Removes every entry that references a destroyed package from a
/// (parent) frame.
pub(crate) fn purge_package(frame: &mut Frame, name: &Name) {
    frame.vars.retain(|(pkg, _)| pkg != name);
    frame.packs.retain(|pkg| pkg != name);
}
