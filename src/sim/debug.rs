//! Utilities to debug simulation.
//!
//! The key type here is [`Breakpoint`], which can be inserted into the
//! [`Simulator`]'s breakpoint list to stop [`Simulator::run`] between
//! instructions.
//!
//! [`Simulator::run`]: super::Simulator::run

use std::fmt::Write;

use slotmap::{new_key_type, SlotMap};

use super::Simulator;

/// Conditions that stop the simulator between instructions.
pub enum Breakpoint {
    /// Break when the PC equals the given physical or virtual address.
    Pc(u32),

    /// Break when general register `r0`-`r7` matches the predicate.
    Reg {
        /// Register number, 0-7.
        reg: u8,
        /// Predicate to break against.
        value: Comparator,
    },

    /// Break when the 32-bit word at a physical address matches the
    /// predicate. Never faults and never triggers device side effects;
    /// unreadable addresses simply don't match.
    Mem {
        /// Physical address of the (big-endian) word.
        addr: u32,
        /// Predicate to break against.
        value: Comparator,
    },

    /// Breaks based on an arbitrarily defined function.
    ///
    /// This can be constructed with [`Breakpoint::generic`].
    Generic(BreakpointFn),

    /// All conditions have to hold for the break to apply.
    And(Box<[Breakpoint]>),
    /// One of the conditions has to hold for the break to apply.
    Or(Box<[Breakpoint]>),
}

type BreakpointFn = Box<dyn Fn(&Simulator) -> bool + Send + Sync + 'static>;

impl Breakpoint {
    /// Creates a breakpoint out of a function.
    pub fn generic(f: impl Fn(&Simulator) -> bool + Send + Sync + 'static) -> Breakpoint {
        Breakpoint::Generic(Box::new(f))
    }

    /// Checks if a break should occur.
    pub fn check(&self, sim: &Simulator) -> bool {
        match self {
            Breakpoint::Pc(expected) => sim.pc() == *expected,
            Breakpoint::Reg { reg, value } => value.check(sim.gpr(*reg)),
            Breakpoint::Mem { addr, value } => {
                sim.mem.peek_word(*addr).is_some_and(|word| value.check(word))
            }
            Breakpoint::Generic(pred) => (pred)(sim),
            Breakpoint::And(conds) => conds.iter().all(|b| b.check(sim)),
            Breakpoint::Or(conds) => conds.iter().any(|b| b.check(sim)),
        }
    }

    fn fmt_bp(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Pc(expected) => write!(f, "PC == {expected:#010X}")?,
            Self::Reg { reg, value } => {
                write!(f, "r{reg} ")?;
                value.fmt_cmp(f)?;
            }
            Self::Mem { addr, value } => {
                write!(f, "mem[{addr:#010X}] ")?;
                value.fmt_cmp(f)?;
            }
            Self::Generic(_) => f.debug_struct("Generic").finish_non_exhaustive()?,
            Self::And(conds) => {
                let Some((last, rest)) = conds.split_last() else {
                    return f.write_str("always");
                };
                for bp in rest {
                    f.write_char('(')?;
                    bp.fmt_bp(f)?;
                    f.write_str(") && ")?;
                }
                f.write_char('(')?;
                last.fmt_bp(f)?;
                f.write_char(')')?;
            }
            Self::Or(conds) => {
                let Some((last, rest)) = conds.split_last() else {
                    return f.write_str("never");
                };
                for bp in rest {
                    f.write_char('(')?;
                    bp.fmt_bp(f)?;
                    f.write_str(") || ")?;
                }
                f.write_char('(')?;
                last.fmt_bp(f)?;
                f.write_char(')')?;
            }
        }
        Ok(())
    }
}
impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Breakpoint(")?;
        self.fmt_bp(f)?;
        f.write_char(')')
    }
}
impl std::ops::BitAnd for Breakpoint {
    type Output = Breakpoint;

    fn bitand(self, rhs: Self) -> Self::Output {
        let mut result = vec![];
        match (self, rhs) {
            (Self::And(left), Self::And(right)) => {
                result.extend(Vec::from(left));
                result.extend(Vec::from(right));
            }
            (Self::And(left), right) => {
                result.extend(Vec::from(left));
                result.push(right);
            }
            (left, Self::And(right)) => {
                result.push(left);
                result.extend(Vec::from(right));
            }
            (left, right) => {
                result.push(left);
                result.push(right);
            }
        }
        Self::And(result.into_boxed_slice())
    }
}
impl std::ops::BitOr for Breakpoint {
    type Output = Breakpoint;

    fn bitor(self, rhs: Self) -> Self::Output {
        let mut result = vec![];
        match (self, rhs) {
            (Self::Or(left), Self::Or(right)) => {
                result.extend(Vec::from(left));
                result.extend(Vec::from(right));
            }
            (Self::Or(left), right) => {
                result.extend(Vec::from(left));
                result.push(right);
            }
            (left, Self::Or(right)) => {
                result.push(left);
                result.extend(Vec::from(right));
            }
            (left, right) => {
                result.push(left);
                result.push(right);
            }
        }
        Self::Or(result.into_boxed_slice())
    }
}

/// Predicate applied to a register or memory value.
#[derive(PartialEq, Eq, Debug)]
pub enum Comparator {
    /// Never breaks.
    Never,
    /// Break if the observed value is less than the given one.
    Lt(u32),
    /// Break if the observed value equals the given one.
    Eq(u32),
    /// Break if the observed value is less than or equal to the given one.
    Le(u32),
    /// Break if the observed value is greater than the given one.
    Gt(u32),
    /// Break if the observed value differs from the given one.
    Ne(u32),
    /// Break if the observed value is greater than or equal to the given one.
    Ge(u32),
    /// Always breaks.
    Always,
}

impl Comparator {
    /// Checks if the operand passes the comparator.
    pub fn check(&self, operand: u32) -> bool {
        match *self {
            Comparator::Never => false,
            Comparator::Lt(r) => operand < r,
            Comparator::Eq(r) => operand == r,
            Comparator::Le(r) => operand <= r,
            Comparator::Gt(r) => operand > r,
            Comparator::Ne(r) => operand != r,
            Comparator::Ge(r) => operand >= r,
            Comparator::Always => true,
        }
    }

    fn fmt_cmp(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Never => f.write_str("never"),
            Comparator::Lt(r) => write!(f, "< {r}"),
            Comparator::Eq(r) => write!(f, "== {r}"),
            Comparator::Le(r) => write!(f, "<= {r}"),
            Comparator::Gt(r) => write!(f, "> {r}"),
            Comparator::Ne(r) => write!(f, "!= {r}"),
            Comparator::Ge(r) => write!(f, ">= {r}"),
            Comparator::Always => f.write_str("always"),
        }
    }
}

new_key_type! {
    /// Key to index into a breakpoint list.
    pub struct BreakpointKey;
}

/// A list of breakpoints.
///
/// This works like GDB breakpoints: inserting a breakpoint returns a key
/// which can be used to query or remove it later.
#[derive(Debug, Default)]
pub struct BreakpointList {
    inner: SlotMap<BreakpointKey, Breakpoint>,
}

impl BreakpointList {
    /// Creates an empty breakpoint list.
    pub fn new() -> Self {
        Default::default()
    }

    /// Inserts a breakpoint and returns its key.
    pub fn insert(&mut self, bpt: Breakpoint) -> BreakpointKey {
        self.inner.insert(bpt)
    }

    /// Removes the breakpoint with the given key, returning it if it was
    /// still present.
    pub fn remove(&mut self, key: BreakpointKey) -> Option<Breakpoint> {
        self.inner.remove(key)
    }

    /// Gets the breakpoint with the given key.
    pub fn get(&self, key: BreakpointKey) -> Option<&Breakpoint> {
        self.inner.get(key)
    }

    /// The number of breakpoints defined.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Removes all breakpoints.
    pub fn clear(&mut self) {
        self.inner.clear()
    }

    /// Iterates over all breakpoints in arbitrary order.
    pub fn values(&self) -> slotmap::basic::Values<BreakpointKey, Breakpoint> {
        self.inner.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinators_flatten() {
        let bp = Breakpoint::Pc(0x40)
            & Breakpoint::Reg {
                reg: 0,
                value: Comparator::Ge(10),
            }
            & Breakpoint::Reg {
                reg: 0,
                value: Comparator::Lt(20),
            };
        let Breakpoint::And(conds) = bp else {
            panic!("expected an And breakpoint");
        };
        assert_eq!(conds.len(), 3);
    }

    #[test]
    fn comparators() {
        assert!(Comparator::Always.check(0));
        assert!(!Comparator::Never.check(0));
        assert!(Comparator::Lt(5).check(4));
        assert!(!Comparator::Lt(5).check(5));
        assert!(Comparator::Ge(5).check(5));
        assert!(Comparator::Ne(5).check(6));
    }

    #[test]
    fn list_keys_are_stable() {
        let mut list = BreakpointList::new();
        let a = list.insert(Breakpoint::Pc(0x40));
        let b = list.insert(Breakpoint::Pc(0x44));

        assert!(list.remove(a).is_some());
        assert!(list.get(b).is_some());
        assert!(list.remove(a).is_none());
        assert_eq!(list.len(), 1);
    }
}
