//! Stack-frame planning for one generated function.
//!
//! All boilerplates stitched into a function share a single frame. The
//! planner hands out two kinds of storage from it:
//!
//! - **temps**: 8-byte slots for intermediate values, recycled through a
//!   free list;
//! - **local variables**: arbitrarily sized, aligned regions whose scopes
//!   nest with stack discipline and only open or close while no temp is
//!   live.
//!
//! The frame size the function needs is the high-water mark of both.

#[cfg(debug_assertions)]
use std::collections::HashSet;

/// Every temp slot is exactly this many bytes.
pub const TEMP_SLOT_SIZE: u32 = 8;

fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Default)]
pub struct StackFramePlanner {
    /// First byte above every local variable and grown temp.
    current: u32,
    /// High-water mark of `current`.
    max_size: u32,
    free_temps: Vec<u32>,
    live_temps: usize,
    /// `current` before each open local variable.
    local_var_bases: Vec<u32>,
    #[cfg(debug_assertions)]
    used_temps: HashSet<u32>,
}

impl StackFramePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire an 8-byte temp slot.
    pub fn get_temp(&mut self) -> u32 {
        let offset = match self.free_temps.pop() {
            Some(offset) => offset,
            None => {
                let offset = align_up(self.current, TEMP_SLOT_SIZE);
                self.current = offset + TEMP_SLOT_SIZE;
                self.max_size = self.max_size.max(self.current);
                offset
            }
        };
        #[cfg(debug_assertions)]
        {
            let fresh = self.used_temps.insert(offset);
            debug_assert!(fresh, "temp slot {offset} handed out twice");
        }
        self.live_temps += 1;
        offset
    }

    /// Return a temp slot obtained from [`StackFramePlanner::get_temp`].
    pub fn free_temp(&mut self, offset: u32) {
        assert!(self.live_temps > 0, "free_temp({offset}) with no live temps");
        #[cfg(debug_assertions)]
        {
            let was_live = self.used_temps.remove(&offset);
            debug_assert!(was_live, "temp slot {offset} freed but not live");
        }
        self.live_temps -= 1;
        self.free_temps.push(offset);
    }

    pub fn is_no_temp_in_use(&self) -> bool {
        self.live_temps == 0
    }

    pub fn live_temp_count(&self) -> usize {
        self.live_temps
    }

    /// Open a local variable of `size` bytes aligned to `alignment`.
    ///
    /// # Panics
    /// Panics if a temp is live or `alignment` is not a power of two.
    pub fn get_local_var(&mut self, size: u32, alignment: u32) -> u32 {
        assert!(
            self.is_no_temp_in_use(),
            "local variable requested while {} temp(s) are live",
            self.live_temps
        );
        assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
        self.local_var_bases.push(self.current);
        let offset = align_up(self.current, alignment);
        self.current = offset + size;
        self.max_size = self.max_size.max(self.current);
        offset
    }

    /// Close the innermost local variable.
    ///
    /// # Panics
    /// Panics if a temp is live or no local variable is open.
    pub fn pop_local_var(&mut self) {
        assert!(
            self.is_no_temp_in_use(),
            "local variable popped while {} temp(s) are live",
            self.live_temps
        );
        let base = self
            .local_var_bases
            .pop()
            .unwrap_or_else(|| panic!("pop_local_var with no open local variable"));
        self.current = base;
        // Slots above the restored top overlap the next allocations.
        self.free_temps.retain(|&offset| offset + TEMP_SLOT_SIZE <= base);
    }

    pub fn local_var_depth(&self) -> usize {
        self.local_var_bases.len()
    }

    /// Frame size needed by everything planned so far, rounded to 8 bytes.
    pub fn final_frame_size(&self) -> u32 {
        align_up(self.max_size, TEMP_SLOT_SIZE)
    }
}
