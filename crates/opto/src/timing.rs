//! Pass timing.
//!
//! [`start`] returns a timer that charges the elapsed wall time to its pass when dropped. Timers
//! nest: time spent in an inner pass is also recorded as child time of the enclosing one, so the
//! report can show both inclusive and exclusive time.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

/// A timed pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// The whole escape analysis driven pipeline.
    Optimize,
    /// One escape analysis invocation.
    EscapeAnalysis,
    /// Building the connection graph.
    ConnectionGraph,
    /// Propagating escape states.
    PropagateEscape,
    /// Reducing allocation merges.
    ReduceMerges,
    /// Giving unique instances their own memory slices.
    SplitUniqueTypes,
    /// Eliminating macro nodes.
    MacroEliminate,
    /// Expanding the remaining macro nodes.
    MacroExpand,
    /// Expanding collector barriers.
    BarrierExpand,
    /// Lowering array copies to loads and stores.
    ArraycopyLower,
}

impl Pass {
    /// Every pass, in report order.
    pub const ALL: [Pass; 10] = [
        Pass::Optimize,
        Pass::EscapeAnalysis,
        Pass::ConnectionGraph,
        Pass::PropagateEscape,
        Pass::ReduceMerges,
        Pass::SplitUniqueTypes,
        Pass::MacroEliminate,
        Pass::MacroExpand,
        Pass::BarrierExpand,
        Pass::ArraycopyLower,
    ];

    /// Name printed in reports.
    pub fn description(self) -> &'static str {
        match self {
            Pass::Optimize => "Escape analysis driven optimization",
            Pass::EscapeAnalysis => "Escape analysis",
            Pass::ConnectionGraph => "Connection graph construction",
            Pass::PropagateEscape => "Escape state propagation",
            Pass::ReduceMerges => "Allocation merge reduction",
            Pass::SplitUniqueTypes => "Memory slice splitting",
            Pass::MacroEliminate => "Macro node elimination",
            Pass::MacroExpand => "Macro node expansion",
            Pass::BarrierExpand => "GC barrier expansion",
            Pass::ArraycopyLower => "Array copy lowering",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Clone, Copy, Default)]
struct Spent {
    total: Duration,
    nested: Duration,
}

/// Time spent in each pass on one thread.
#[derive(Default)]
pub struct PassTimes {
    spent: [Spent; Pass::ALL.len()],
}

impl PassTimes {
    /// Time spent in `pass`, including the passes it ran.
    pub fn inclusive(&self, pass: Pass) -> Duration {
        self.spent[pass as usize].total
    }

    /// Time spent in `pass` itself.
    pub fn exclusive(&self, pass: Pass) -> Duration {
        let s = self.spent[pass as usize];
        s.total.saturating_sub(s.nested)
    }

    /// Sum of the exclusive times.
    pub fn total(&self) -> Duration {
        Pass::ALL.iter().map(|&p| self.exclusive(p)).sum()
    }

    /// Add the times of `other`.
    pub fn add(&mut self, other: &Self) {
        for (a, b) in self.spent.iter_mut().zip(&other.spent) {
            a.total += b.total;
            a.nested += b.nested;
        }
    }
}

impl fmt::Display for PassTimes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{:>10} {:>10}  pass", "inclusive", "exclusive")?;
        for pass in Pass::ALL {
            if self.inclusive(pass).is_zero() {
                continue;
            }
            let ms = |d: Duration| d.as_secs_f64() * 1e3;
            writeln!(
                f,
                "{:>8.3}ms {:>8.3}ms  {pass}",
                ms(self.inclusive(pass)),
                ms(self.exclusive(pass))
            )?;
        }
        Ok(())
    }
}

thread_local! {
    static RUNNING: Cell<Option<Pass>> = const { Cell::new(None) };
    static TIMES: RefCell<PassTimes> = RefCell::new(PassTimes::default());
}

/// Charges the time until it is dropped to its pass.
#[must_use = "the pass ends when the timer is dropped"]
pub struct PassTimer {
    pass: Pass,
    outer: Option<Pass>,
    start: Instant,
}

/// Start timing `pass` on the current thread.
pub fn start(pass: Pass) -> PassTimer {
    let outer = RUNNING.with(|r| r.replace(Some(pass)));
    log::debug!("timing: {pass} started");
    PassTimer {
        pass,
        outer,
        start: Instant::now(),
    }
}

impl Drop for PassTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let running = RUNNING.with(|r| r.replace(self.outer));
        debug_assert_eq!(running, Some(self.pass), "pass timers must end innermost first");
        log::debug!("timing: {} took {elapsed:?}", self.pass);
        TIMES.with(|t| {
            let mut t = t.borrow_mut();
            t.spent[self.pass as usize].total += elapsed;
            if let Some(outer) = self.outer {
                t.spent[outer as usize].nested += elapsed;
            }
        });
    }
}

/// Take the times collected on the current thread, leaving them empty.
pub fn take_current() -> PassTimes {
    TIMES.with(|t| t.take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions() {
        assert_eq!(Pass::SplitUniqueTypes.to_string(), "Memory slice splitting");
        for (i, p) in Pass::ALL.into_iter().enumerate() {
            assert_eq!(p as usize, i);
        }
    }

    #[test]
    fn nested_time_is_not_counted_twice() {
        let _ = take_current();
        {
            let _outer = start(Pass::Optimize);
            let _inner = start(Pass::EscapeAnalysis);
            std::thread::sleep(Duration::from_millis(2));
        }
        let times = take_current();
        let ea = times.inclusive(Pass::EscapeAnalysis);
        assert!(ea >= Duration::from_millis(2));
        assert!(times.inclusive(Pass::Optimize) >= ea);
        assert!(times.exclusive(Pass::Optimize) < ea);
        assert_eq!(times.total(), times.inclusive(Pass::Optimize));
        let report = times.to_string();
        assert!(report.contains("Escape analysis driven optimization"));
        assert!(!report.contains("Array copy lowering"));
        assert!(take_current().total().is_zero());
    }
}
