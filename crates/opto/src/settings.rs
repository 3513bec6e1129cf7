//! Optimizer settings.
//!
//! Settings are configured through a [`Builder`] and then frozen into an immutable [`Flags`]
//! value which is consulted by every pass. All the numeric budgets the analysis uses are
//! settings rather than constants.
//!
//! ```text
//! let mut b = settings::builder();
//! b.set("gc", "satb")?;
//! b.set("escape_analysis_max_iterations", "4")?;
//! let flags = settings::Flags::new(b);
//! ```

use core::fmt;
use core::str::FromStr;
#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// An error produced when changing a setting.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SetError {
    /// No setting by this name exists.
    #[error("No existing setting named '{0}'")]
    BadName(String),

    /// Type mismatch for setting (e.g., setting an enum setting as a bool).
    #[error("Trying to set a setting with the wrong type")]
    BadType,

    /// This is not a valid value for this setting.
    #[error("Unexpected value for a setting, expected {0}")]
    BadValue(String),
}

/// A result returned when changing a setting.
pub type SetResult<T> = Result<T, SetError>;

/// The garbage collector whose barrier policy is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum GcKind {
    /// Non-moving collector without barriers.
    NoOp,
    /// Generational collector with a card table post-barrier.
    CardTable,
    /// Concurrent marking collector with SATB pre-barriers and an enqueue barrier.
    Satb,
}

impl fmt::Display for GcKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            GcKind::NoOp => "no-op",
            GcKind::CardTable => "card-table",
            GcKind::Satb => "satb",
        })
    }
}

impl FromStr for GcKind {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "no-op" => Ok(GcKind::NoOp),
            "card-table" => Ok(GcKind::CardTable),
            "satb" => Ok(GcKind::Satb),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy)]
enum Detail {
    Bool,
    Num,
    Gc,
}

struct Descriptor {
    name: &'static str,
    detail: Detail,
    description: &'static str,
}

const DESCRIPTORS: &[Descriptor] = &[
    Descriptor {
        name: "do_escape_analysis",
        detail: Detail::Bool,
        description: "Build the connection graph and classify allocations",
    },
    Descriptor {
        name: "eliminate_allocations",
        detail: Detail::Bool,
        description: "Scalar replace non-escaping allocations",
    },
    Descriptor {
        name: "eliminate_locks",
        detail: Detail::Bool,
        description: "Remove locking of non-escaping objects",
    },
    Descriptor {
        name: "eliminate_autobox",
        detail: Detail::Bool,
        description: "Remove boxing calls whose result does not escape",
    },
    Descriptor {
        name: "optimize_ptr_compare",
        detail: Detail::Bool,
        description: "Fold pointer compares of distinct non-escaping objects",
    },
    Descriptor {
        name: "reduce_allocation_merges",
        detail: Detail::Bool,
        description: "Split Phis merging scalar replaceable allocations",
    },
    Descriptor {
        name: "iterative_escape_analysis",
        detail: Detail::Bool,
        description: "Rerun escape analysis after eliminations made progress",
    },
    Descriptor {
        name: "verify_connection_graph",
        detail: Detail::Bool,
        description: "Check connection graph invariants after construction",
    },
    Descriptor {
        name: "escape_analysis_timeout_ms",
        detail: Detail::Num,
        description: "Wall clock budget for the propagation loop",
    },
    Descriptor {
        name: "escape_analysis_max_iterations",
        detail: Detail::Num,
        description: "Iteration cap for the propagation loop",
    },
    Descriptor {
        name: "max_node_limit",
        detail: Detail::Num,
        description: "Ceiling on live IR nodes",
    },
    Descriptor {
        name: "node_limit_fudge_factor",
        detail: Detail::Num,
        description: "Headroom kept below the node ceiling",
    },
    Descriptor {
        name: "eliminate_allocation_array_size_limit",
        detail: Detail::Num,
        description: "Longest array eligible for scalar replacement",
    },
    Descriptor {
        name: "eliminate_allocation_fields_limit",
        detail: Detail::Num,
        description: "Most fields a scalarized object may describe",
    },
    Descriptor {
        name: "value_search_limit",
        detail: Detail::Num,
        description: "Bound on memory chain walks when looking for a field value",
    },
    Descriptor {
        name: "array_copy_load_store_max_elem",
        detail: Detail::Num,
        description: "Largest constant element count inlined as loads and stores",
    },
    Descriptor {
        name: "use_cond_card_mark",
        detail: Detail::Bool,
        description: "Check the card before dirtying it",
    },
    Descriptor {
        name: "reduce_initial_card_marks",
        detail: Detail::Bool,
        description: "Skip card marks for stores into tightly coupled fresh objects",
    },
    Descriptor {
        name: "card_shift",
        detail: Detail::Num,
        description: "log2 of the card size in bytes",
    },
    Descriptor {
        name: "use_compressed_oops",
        detail: Detail::Bool,
        description: "Heap references are 32-bit",
    },
    Descriptor {
        name: "support_iriw",
        detail: Detail::Bool,
        description: "Order independent reads of independent writes on weak memory machines",
    },
    Descriptor {
        name: "gc",
        detail: Detail::Gc,
        description: "Active collector: no-op, card-table or satb",
    },
];

/// Collect settings before freezing them into [`Flags`].
#[derive(Clone)]
pub struct Builder {
    flags: Flags,
}

/// Create a settings builder with every setting at its default value.
pub fn builder() -> Builder {
    Builder {
        flags: Flags::default(),
    }
}

fn parse_bool(value: &str) -> SetResult<bool> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(SetError::BadValue("bool".to_string())),
    }
}

fn parse_num(value: &str) -> SetResult<u32> {
    value
        .parse()
        .map_err(|_| SetError::BadValue("number".to_string()))
}

impl Builder {
    fn lookup(&self, name: &str) -> SetResult<Detail> {
        DESCRIPTORS
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.detail)
            .ok_or_else(|| SetError::BadName(name.to_string()))
    }

    /// Enable a boolean setting.
    pub fn enable(&mut self, name: &str) -> SetResult<()> {
        match self.lookup(name)? {
            Detail::Bool => self.set(name, "true"),
            _ => Err(SetError::BadType),
        }
    }

    /// Set the string value of any setting.
    pub fn set(&mut self, name: &str, value: &str) -> SetResult<()> {
        let detail = self.lookup(name)?;
        let f = &mut self.flags;
        match detail {
            Detail::Bool => {
                let v = parse_bool(value)?;
                match name {
                    "do_escape_analysis" => f.do_escape_analysis = v,
                    "eliminate_allocations" => f.eliminate_allocations = v,
                    "eliminate_locks" => f.eliminate_locks = v,
                    "eliminate_autobox" => f.eliminate_autobox = v,
                    "optimize_ptr_compare" => f.optimize_ptr_compare = v,
                    "reduce_allocation_merges" => f.reduce_allocation_merges = v,
                    "iterative_escape_analysis" => f.iterative_escape_analysis = v,
                    "verify_connection_graph" => f.verify_connection_graph = v,
                    "use_cond_card_mark" => f.use_cond_card_mark = v,
                    "reduce_initial_card_marks" => f.reduce_initial_card_marks = v,
                    "use_compressed_oops" => f.use_compressed_oops = v,
                    "support_iriw" => f.support_iriw = v,
                    _ => return Err(SetError::BadName(name.to_string())),
                }
            }
            Detail::Num => {
                let v = parse_num(value)?;
                match name {
                    "escape_analysis_timeout_ms" => f.escape_analysis_timeout_ms = v,
                    "escape_analysis_max_iterations" => f.escape_analysis_max_iterations = v,
                    "max_node_limit" => f.max_node_limit = v,
                    "node_limit_fudge_factor" => f.node_limit_fudge_factor = v,
                    "eliminate_allocation_array_size_limit" => {
                        f.eliminate_allocation_array_size_limit = v
                    }
                    "eliminate_allocation_fields_limit" => f.eliminate_allocation_fields_limit = v,
                    "value_search_limit" => f.value_search_limit = v,
                    "array_copy_load_store_max_elem" => f.array_copy_load_store_max_elem = v,
                    "card_shift" => {
                        if v == 0 || v > 16 {
                            return Err(SetError::BadValue("a shift in 1..=16".to_string()));
                        }
                        f.card_shift = v
                    }
                    _ => return Err(SetError::BadName(name.to_string())),
                }
            }
            Detail::Gc => {
                f.gc = value
                    .parse()
                    .map_err(|()| SetError::BadValue("no-op, card-table or satb".to_string()))?;
            }
        }
        Ok(())
    }

    /// Choose the active collector.
    pub fn gc(&mut self, gc: GcKind) -> &mut Self {
        self.flags.gc = gc;
        self
    }
}

/// Frozen optimizer settings.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Flags {
    do_escape_analysis: bool,
    eliminate_allocations: bool,
    eliminate_locks: bool,
    eliminate_autobox: bool,
    optimize_ptr_compare: bool,
    reduce_allocation_merges: bool,
    iterative_escape_analysis: bool,
    verify_connection_graph: bool,
    escape_analysis_timeout_ms: u32,
    escape_analysis_max_iterations: u32,
    max_node_limit: u32,
    node_limit_fudge_factor: u32,
    eliminate_allocation_array_size_limit: u32,
    eliminate_allocation_fields_limit: u32,
    value_search_limit: u32,
    array_copy_load_store_max_elem: u32,
    use_cond_card_mark: bool,
    reduce_initial_card_marks: bool,
    card_shift: u32,
    use_compressed_oops: bool,
    support_iriw: bool,
    gc: GcKind,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            do_escape_analysis: true,
            eliminate_allocations: true,
            eliminate_locks: true,
            eliminate_autobox: true,
            optimize_ptr_compare: true,
            reduce_allocation_merges: true,
            iterative_escape_analysis: true,
            verify_connection_graph: cfg!(debug_assertions),
            escape_analysis_timeout_ms: 20,
            escape_analysis_max_iterations: 20,
            max_node_limit: 80_000,
            node_limit_fudge_factor: 2_000,
            eliminate_allocation_array_size_limit: 64,
            eliminate_allocation_fields_limit: 512,
            value_search_limit: 1_000,
            array_copy_load_store_max_elem: 8,
            use_cond_card_mark: false,
            reduce_initial_card_marks: true,
            card_shift: 9,
            use_compressed_oops: true,
            support_iriw: false,
            gc: GcKind::CardTable,
        }
    }
}

impl Flags {
    /// Freeze the settings collected by `builder`.
    pub fn new(builder: Builder) -> Self {
        builder.flags
    }

    /// Build the connection graph and classify allocations.
    pub fn do_escape_analysis(&self) -> bool {
        self.do_escape_analysis
    }
    /// Scalar replace non-escaping allocations.
    pub fn eliminate_allocations(&self) -> bool {
        self.eliminate_allocations
    }
    /// Remove locking of non-escaping objects.
    pub fn eliminate_locks(&self) -> bool {
        self.eliminate_locks
    }
    /// Remove boxing calls whose result does not escape.
    pub fn eliminate_autobox(&self) -> bool {
        self.eliminate_autobox
    }
    /// Fold pointer compares of distinct non-escaping objects.
    pub fn optimize_ptr_compare(&self) -> bool {
        self.optimize_ptr_compare
    }
    /// Split Phis merging scalar replaceable allocations.
    pub fn reduce_allocation_merges(&self) -> bool {
        self.reduce_allocation_merges
    }
    /// Rerun escape analysis after eliminations made progress.
    pub fn iterative_escape_analysis(&self) -> bool {
        self.iterative_escape_analysis
    }
    /// Check connection graph invariants after construction.
    pub fn verify_connection_graph(&self) -> bool {
        self.verify_connection_graph
    }
    /// Wall clock budget for the propagation loop, in milliseconds.
    pub fn escape_analysis_timeout_ms(&self) -> u32 {
        self.escape_analysis_timeout_ms
    }
    /// Iteration cap for the propagation loop.
    pub fn escape_analysis_max_iterations(&self) -> u32 {
        self.escape_analysis_max_iterations
    }
    /// Ceiling on live IR nodes.
    pub fn max_node_limit(&self) -> u32 {
        self.max_node_limit
    }
    /// Headroom kept below the node ceiling.
    pub fn node_limit_fudge_factor(&self) -> u32 {
        self.node_limit_fudge_factor
    }
    /// Longest array eligible for scalar replacement.
    pub fn eliminate_allocation_array_size_limit(&self) -> u32 {
        self.eliminate_allocation_array_size_limit
    }
    /// Most fields a scalarized object may describe.
    pub fn eliminate_allocation_fields_limit(&self) -> u32 {
        self.eliminate_allocation_fields_limit
    }
    /// Bound on memory chain walks when looking for a field value.
    pub fn value_search_limit(&self) -> u32 {
        self.value_search_limit
    }
    /// Largest constant element count inlined as loads and stores.
    pub fn array_copy_load_store_max_elem(&self) -> u32 {
        self.array_copy_load_store_max_elem
    }
    /// Check the card before dirtying it.
    pub fn use_cond_card_mark(&self) -> bool {
        self.use_cond_card_mark
    }
    /// Skip card marks for stores into tightly coupled fresh objects.
    pub fn reduce_initial_card_marks(&self) -> bool {
        self.reduce_initial_card_marks
    }
    /// log2 of the card size in bytes.
    pub fn card_shift(&self) -> u32 {
        self.card_shift
    }
    /// Heap references are 32-bit.
    pub fn use_compressed_oops(&self) -> bool {
        self.use_compressed_oops
    }
    /// Order independent reads of independent writes on weak memory machines.
    pub fn support_iriw(&self) -> bool {
        self.support_iriw
    }
    /// Active collector.
    pub fn gc(&self) -> GcKind {
        self.gc
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "[opto]")?;
        for d in DESCRIPTORS {
            let value = match d.name {
                "do_escape_analysis" => self.do_escape_analysis.to_string(),
                "eliminate_allocations" => self.eliminate_allocations.to_string(),
                "eliminate_locks" => self.eliminate_locks.to_string(),
                "eliminate_autobox" => self.eliminate_autobox.to_string(),
                "optimize_ptr_compare" => self.optimize_ptr_compare.to_string(),
                "reduce_allocation_merges" => self.reduce_allocation_merges.to_string(),
                "iterative_escape_analysis" => self.iterative_escape_analysis.to_string(),
                "verify_connection_graph" => self.verify_connection_graph.to_string(),
                "escape_analysis_timeout_ms" => self.escape_analysis_timeout_ms.to_string(),
                "escape_analysis_max_iterations" => {
                    self.escape_analysis_max_iterations.to_string()
                }
                "max_node_limit" => self.max_node_limit.to_string(),
                "node_limit_fudge_factor" => self.node_limit_fudge_factor.to_string(),
                "eliminate_allocation_array_size_limit" => {
                    self.eliminate_allocation_array_size_limit.to_string()
                }
                "eliminate_allocation_fields_limit" => {
                    self.eliminate_allocation_fields_limit.to_string()
                }
                "value_search_limit" => self.value_search_limit.to_string(),
                "array_copy_load_store_max_elem" => {
                    self.array_copy_load_store_max_elem.to_string()
                }
                "use_cond_card_mark" => self.use_cond_card_mark.to_string(),
                "reduce_initial_card_marks" => self.reduce_initial_card_marks.to_string(),
                "card_shift" => self.card_shift.to_string(),
                "use_compressed_oops" => self.use_compressed_oops.to_string(),
                "support_iriw" => self.support_iriw.to_string(),
                "gc" => self.gc.to_string(),
                _ => continue,
            };
            writeln!(f, "{} = {}  # {}", d.name, value, d.description)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_default() {
        let f = Flags::new(builder());
        let text = f.to_string();
        assert!(text.starts_with("[opto]\n"));
        assert!(text.contains("gc = card-table"));
        assert!(text.contains("escape_analysis_max_iterations = 20"));
    }

    #[test]
    fn set_values() {
        let mut b = builder();
        assert_eq!(b.enable("not_there"), Err(SetError::BadName("not_there".to_string())));
        assert_eq!(b.enable("card_shift"), Err(SetError::BadType));
        assert_eq!(
            b.set("use_cond_card_mark", "maybe"),
            Err(SetError::BadValue("bool".to_string()))
        );
        assert!(b.set("card_shift", "0").is_err());
        b.set("gc", "satb").unwrap();
        b.set("escape_analysis_max_iterations", "3").unwrap();
        b.enable("use_cond_card_mark").unwrap();

        let f = Flags::new(b);
        assert_eq!(f.gc(), GcKind::Satb);
        assert_eq!(f.escape_analysis_max_iterations(), 3);
        assert!(f.use_cond_card_mark());
    }
}
