//! Operand stack with register-convention spilling.
//!
//! Boilerplates pass a few live operands in registers (a fixed number of
//! integer and floating-point ones). Once more operands of a class are live
//! than there are registers, the oldest ones of that class move to temp
//! slots of the frame. The number of operands still in registers is part of
//! the parameter tuple when selecting a boilerplate, since each spill count
//! has its own variant.

use crate::frame::StackFramePlanner;

pub const MAX_INTEGRAL_REGISTER_OPERANDS: usize = 3;
pub const MAX_FLOAT_REGISTER_OPERANDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandClass {
    Integral,
    FloatingPoint,
}

impl OperandClass {
    pub fn register_limit(self) -> usize {
        match self {
            Self::Integral => MAX_INTEGRAL_REGISTER_OPERANDS,
            Self::FloatingPoint => MAX_FLOAT_REGISTER_OPERANDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLocation {
    Register,
    /// Temp slot offset in the frame.
    Spilled(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub class: OperandClass,
    pub location: OperandLocation,
}

impl Operand {
    pub fn is_spilled(&self) -> bool {
        matches!(self.location, OperandLocation::Spilled(_))
    }
}

#[derive(Debug, Default)]
pub struct OperandStack {
    operands: Vec<Operand>,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an operand, spilling the oldest register operand of its class
    /// if the class is over its register limit.
    pub fn push(&mut self, frame: &mut StackFramePlanner, class: OperandClass) -> usize {
        self.operands.push(Operand {
            class,
            location: OperandLocation::Register,
        });
        if self.num_no_spill_of(class) > class.register_limit() {
            if let Some(oldest) = self
                .operands
                .iter_mut()
                .find(|op| op.class == class && !op.is_spilled())
            {
                oldest.location = OperandLocation::Spilled(frame.get_temp());
            }
        }
        self.operands.len() - 1
    }

    /// Pop the top operand, releasing its temp slot if it was spilled.
    pub fn pop(&mut self, frame: &mut StackFramePlanner) -> Option<Operand> {
        let operand = self.operands.pop()?;
        if let OperandLocation::Spilled(offset) = operand.location {
            frame.free_temp(offset);
        }
        Some(operand)
    }

    /// Move every register operand to a temp slot.
    pub fn force_spill_all(&mut self, frame: &mut StackFramePlanner) {
        for op in self.operands.iter_mut().filter(|op| !op.is_spilled()) {
            op.location = OperandLocation::Spilled(frame.get_temp());
        }
    }

    /// Operands still conveyed in registers.
    pub fn num_no_spill(&self) -> usize {
        self.operands.iter().filter(|op| !op.is_spilled()).count()
    }

    pub fn num_no_spill_of(&self, class: OperandClass) -> usize {
        self.operands
            .iter()
            .filter(|op| op.class == class && !op.is_spilled())
            .count()
    }

    pub fn get(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    pub fn top(&self) -> Option<&Operand> {
        self.operands.last()
    }

    pub fn len(&self) -> usize {
        self.operands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spills_oldest_past_limit() {
        let mut frame = StackFramePlanner::new();
        let mut stack = OperandStack::new();
        for _ in 0..MAX_INTEGRAL_REGISTER_OPERANDS {
            stack.push(&mut frame, OperandClass::Integral);
        }
        assert_eq!(stack.num_no_spill(), 3);
        assert!(frame.is_no_temp_in_use());

        stack.push(&mut frame, OperandClass::Integral);
        assert_eq!(stack.num_no_spill(), 3);
        assert_eq!(stack.get(0).unwrap().location, OperandLocation::Spilled(0));
        assert!(!stack.top().unwrap().is_spilled());
    }

    #[test]
    fn classes_have_separate_limits() {
        let mut frame = StackFramePlanner::new();
        let mut stack = OperandStack::new();
        for _ in 0..3 {
            stack.push(&mut frame, OperandClass::Integral);
            stack.push(&mut frame, OperandClass::FloatingPoint);
        }
        assert_eq!(stack.num_no_spill(), 6);
        stack.push(&mut frame, OperandClass::FloatingPoint);
        assert_eq!(stack.num_no_spill_of(OperandClass::Integral), 3);
        assert_eq!(stack.num_no_spill_of(OperandClass::FloatingPoint), 3);
        assert!(stack.get(1).unwrap().is_spilled());
    }

    #[test]
    fn pop_releases_spill_slots() {
        let mut frame = StackFramePlanner::new();
        let mut stack = OperandStack::new();
        stack.push(&mut frame, OperandClass::Integral);
        stack.push(&mut frame, OperandClass::Integral);
        stack.force_spill_all(&mut frame);
        assert_eq!(stack.num_no_spill(), 0);
        assert_eq!(frame.live_temp_count(), 2);
        while stack.pop(&mut frame).is_some() {}
        assert!(frame.is_no_temp_in_use());
        assert_eq!(frame.final_frame_size(), 16);
        assert!(stack.pop(&mut frame).is_none());
    }
}
