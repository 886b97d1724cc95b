//! Integration tests for the runtime half: frame planning with an operand
//! stack, and specialization of hand-written blueprints.

use patchwork_core::{Blueprint, FixupCounts, FixupSite};
use patchwork_rt::*;

// =============================================================================
// Frame planning
// =============================================================================

#[test]
fn operand_spills_share_frame_with_locals() {
    let mut frame = StackFramePlanner::new();
    let outer = frame.get_local_var(16, 16);
    assert_eq!(outer, 0);

    let mut stack = OperandStack::new();
    for _ in 0..5 {
        stack.push(&mut frame, OperandClass::Integral);
    }
    stack.push(&mut frame, OperandClass::FloatingPoint);
    assert_eq!(stack.num_no_spill_of(OperandClass::Integral), 3);
    assert_eq!(stack.num_no_spill_of(OperandClass::FloatingPoint), 1);
    assert_eq!(stack.num_no_spill(), 4);

    // The two oldest integral operands went to temps above the local.
    let spilled: Vec<u32> = (0..2)
        .map(|i| match stack.get(i).unwrap().location {
            OperandLocation::Spilled(offset) => offset,
            OperandLocation::Register => panic!("operand {i} should be spilled"),
        })
        .collect();
    assert!(spilled.iter().all(|&offset| offset >= 16));
    assert_ne!(spilled[0], spilled[1]);

    stack.force_spill_all(&mut frame);
    assert_eq!(stack.num_no_spill(), 0);
    let peak = frame.final_frame_size();
    assert_eq!(peak, 16 + 6 * 8);

    while stack.pop(&mut frame).is_some() {}
    assert!(frame.is_no_temp_in_use());
    frame.pop_local_var();
    assert_eq!(frame.local_var_depth(), 0);
    assert_eq!(frame.final_frame_size(), peak);
}

#[test]
fn nested_locals_never_overlap_live_temps() {
    let mut frame = StackFramePlanner::new();
    let mut sizes = Vec::new();

    let a = frame.get_local_var(4, 4);
    let b = frame.get_local_var(8, 8);
    assert!(b >= a + 4);
    let t0 = frame.get_temp();
    let t1 = frame.get_temp();
    assert!(t0 >= b + 8 && t1 >= b + 8 && t0 != t1);
    sizes.push(frame.final_frame_size());

    frame.free_temp(t0);
    frame.free_temp(t1);
    frame.pop_local_var();
    let t2 = frame.get_temp();
    assert!(t2 >= a + 4);
    sizes.push(frame.final_frame_size());
    frame.free_temp(t2);
    frame.pop_local_var();
    sizes.push(frame.final_frame_size());

    assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(frame.final_frame_size() % 8, 0);
}

// =============================================================================
// Specialization
// =============================================================================

/// `movabs rax, 0; ret` padded to 16 bytes; the immediate is constant 0.
static RET_CONST_CODE: [u8; 16] = [
    0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xc3, 0x0f, 0x1f, 0x44, 0x00, 0x00,
];
static RET_CONST_SITES: [FixupSite; 1] = [FixupSite {
    offset: 2,
    ordinal: 0,
}];

fn ret_const() -> Blueprint<'static> {
    Blueprint {
        symbol: "ret_const",
        code: &RET_CONST_CODE,
        unpadded_len: 11,
        self_relative32: &[],
        symbol32: &[],
        symbol64: &RET_CONST_SITES,
        thread_local32: &[],
        fixup_counts: FixupCounts {
            boilerplate_fns: 0,
            host_fns: 0,
            constants: 1,
        },
    }
}

#[test]
fn specialize_patches_into_plain_memory() {
    let mut dest = [0u8; 32];
    let written = specialize(&ret_const(), &[0x1234], &mut dest, 0x1000).unwrap();
    assert_eq!(written, 16);
    assert_eq!(&dest[2..10], &0x1234u64.to_le_bytes());
    assert_eq!(&dest[16..], &[0u8; 16]);
}

#[test]
fn misuse_is_reported() {
    let mut small = [0u8; 8];
    assert!(matches!(
        specialize(&ret_const(), &[1], &mut small, 0),
        Err(SpecializeError::DestinationTooSmall { needed: 16, available: 8, .. })
    ));
    let mut dest = [0u8; 16];
    assert!(matches!(
        specialize(&ret_const(), &[], &mut dest, 0),
        Err(SpecializeError::FixupValueCount { expected: 1, supplied: 0, .. })
    ));
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn return_constant_round_trip() {
    let mut stitcher = CodeStitcher::with_capacity(64).unwrap();
    let first = stitcher
        .emit(&ret_const(), &FixupValues::new().constant(0x1234))
        .unwrap();
    let second = stitcher
        .emit(&ret_const(), &FixupValues::new().constant(u64::MAX))
        .unwrap();
    assert_eq!(second.offset, 16);

    let buffer = stitcher.finish().unwrap();
    let f: extern "C" fn() -> u64 = unsafe { buffer.function(first.offset) };
    let g: extern "C" fn() -> u64 = unsafe { buffer.function(second.offset) };
    assert_eq!(f(), 0x1234);
    assert_eq!(g(), u64::MAX);
}
