//! Call-graph analysis finding calls that may free safe-pointer targets.
//!
//! A call is conservatively may-free when its target is unknown (indirect),
//! or declared outside this module and not on the non-freeing whitelist, or
//! reaches such a call transitively. The analysis publishes two read-only
//! sets: the may-free functions and the may-free call sites.

use mmsafe_ir::{
    is_check_fn_name, Callee, FnId, InstId, Module, Op, ARRAY_CHECK_FN, SINGLE_CHECK_FN,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// A call instruction, identified by its function and arena slot. The slot
/// survives block splitting, so these stay valid across the splitter pass.
pub type CallSite = (FnId, InstId);

/// External symbols known not to free heap memory.
pub fn default_whitelist() -> BTreeSet<String> {
    [
        "malloc",
        "mm_alloc",
        "mm_array_alloc",
        "printf",
        "abort",
        "exit",
        "srand",
        "atoi",
        "atol",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug)]
pub struct FreeFinder {
    /// Non-freeing symbol names. Read at `run`; the driver may extend it
    /// beforehand.
    pub whitelist: BTreeSet<String>,
    pub may_free_fns: HashSet<FnId>,
    pub may_free_calls: HashSet<CallSite>,
}

impl Default for FreeFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeFinder {
    pub fn new() -> Self {
        Self {
            whitelist: default_whitelist(),
            may_free_fns: HashSet::new(),
            may_free_calls: HashSet::new(),
        }
    }

    /// Run the analysis. Never mutates the module; always returns `false`.
    pub fn run(&mut self, module: &Module) -> bool {
        self.whitelist.insert(SINGLE_CHECK_FN.to_string());
        self.whitelist.insert(ARRAY_CHECK_FN.to_string());
        self.whitelist
            .insert(format!("{}_{}", module.name, SINGLE_CHECK_FN));
        self.whitelist
            .insert(format!("{}_{}", module.name, ARRAY_CHECK_FN));

        // Per-run reachability over the defined-function call graph; dropped
        // when this returns, only the two result sets outlive the analysis.
        let reached_by = reach_analysis(module);
        self.find_may_free_calls(module, &reached_by);
        false
    }

    fn find_may_free_calls(&mut self, module: &Module, reached_by: &HashMap<FnId, HashSet<FnId>>) {
        for caller in &module.functions {
            if caller.is_declaration() || is_check_fn_name(&caller.name) {
                continue;
            }
            for block in &caller.blocks {
                for &iid in &block.insts {
                    let Op::Call { callee, .. } = &caller.inst(iid).op else {
                        continue;
                    };
                    let directly_may_free = match callee {
                        // Unresolved targets are assumed to free.
                        Callee::Indirect(_) => true,
                        Callee::Direct(fid) => {
                            let target = module.function(*fid);
                            target.is_declaration() && !self.whitelist.contains(&target.name)
                        }
                    };
                    if directly_may_free {
                        self.may_free_fns.insert(caller.id);
                        self.may_free_calls.insert((caller.id, iid));
                    }
                }
            }
        }

        // Everything that can reach a may-free function may free too.
        let direct: Vec<FnId> = self.may_free_fns.iter().copied().collect();
        for f in direct {
            if let Some(callers) = reached_by.get(&f) {
                self.may_free_fns.extend(callers.iter().copied());
            }
        }

        // Calls to may-free functions defined in this module.
        for caller in &module.functions {
            if caller.is_declaration() {
                continue;
            }
            for block in &caller.blocks {
                for &iid in &block.insts {
                    if let Op::Call {
                        callee: Callee::Direct(fid),
                        ..
                    } = &caller.inst(iid).op
                    {
                        if self.may_free_fns.contains(fid) {
                            self.may_free_calls.insert((caller.id, iid));
                        }
                    }
                }
            }
        }
    }
}

/// For each defined function, the set of defined functions that can reach it
/// through direct calls. Declaration-only callees and the key-check helpers
/// are not traversed.
fn reach_analysis(module: &Module) -> HashMap<FnId, HashSet<FnId>> {
    let mut callees: HashMap<FnId, Vec<FnId>> = HashMap::new();
    for func in &module.functions {
        if func.is_declaration() || is_check_fn_name(&func.name) {
            continue;
        }
        let mut targets = Vec::new();
        for block in &func.blocks {
            for &iid in &block.insts {
                if let Op::Call {
                    callee: Callee::Direct(fid),
                    ..
                } = &func.inst(iid).op
                {
                    let target = module.function(*fid);
                    if !target.is_declaration() && !is_check_fn_name(&target.name) {
                        targets.push(*fid);
                    }
                }
            }
        }
        callees.insert(func.id, targets);
    }

    let mut reached_by: HashMap<FnId, HashSet<FnId>> = HashMap::new();
    for &f in callees.keys() {
        // Breadth-first sweep of everything f reaches.
        let mut visited: HashSet<FnId> = HashSet::new();
        let mut queue: VecDeque<FnId> = VecDeque::new();
        queue.push_back(f);
        while let Some(cur) = queue.pop_front() {
            let Some(targets) = callees.get(&cur) else {
                continue;
            };
            for &g in targets {
                if visited.insert(g) {
                    queue.push_back(g);
                }
            }
        }
        for g in visited {
            reached_by.entry(g).or_default().insert(f);
        }
    }
    reached_by
}
