// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The bootloader HAL contract the engine consumes.
//!
//! The platform provides the implementation; the engine only requires the
//! calls below. `set_active_slot` must be atomic with respect to a
//! subsequent reboot: either the new slot is chosen or the old one still
//! is, never neither.

use futures::future::LocalBoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A slot index. Dual-slot devices use 0 ("A") and 1 ("B"); the engine
/// supports any count the HAL reports.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Slot(pub u32);

impl Slot {
    pub const A: Slot = Slot(0);
    pub const B: Slot = Slot(1);

    pub fn index(self) -> u32 {
        self.0
    }

    /// The partner slot on a dual-slot device.
    pub fn other(self) -> Slot {
        Slot(1 - self.0 % 2)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match char::from_u32('A' as u32 + self.0) {
            Some(letter) if self.0 < 26 => write!(f, "{letter}"),
            _ => write!(f, "#{}", self.0),
        }
    }
}

/// Slot state lattice. `Unbootable` is terminal for the image in that
/// slot; only a `Bootable` slot can be promoted to `Successful`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    Unbootable,
    Bootable,
    Successful,
}

#[derive(Debug, Error, PartialEq)]
pub enum BootControlError {
    #[error("slot {0} does not exist")]
    InvalidSlot(Slot),
    #[error("refusing to touch the currently booted slot {0}")]
    CurrentSlotProtected(Slot),
    #[error("unknown partition {name:?} on slot {slot}")]
    UnknownPartition { name: String, slot: Slot },
    #[error("boot HAL failure: {0}")]
    Hal(String),
}

pub trait BootControl {
    fn slot_count(&self) -> u32;

    fn current_slot(&self) -> Slot;

    fn is_bootable(&self, slot: Slot) -> bool;

    fn is_marked_successful(&self, slot: Slot) -> bool;

    /// Marks a slot's image as never to be booted again. Must fail on the
    /// currently booted slot.
    fn mark_unbootable(&mut self, slot: Slot) -> Result<(), BootControlError>;

    /// Points the bootloader at `slot` for the next boot.
    fn set_active_slot(&mut self, slot: Slot) -> Result<(), BootControlError>;

    /// One-shot per boot and possibly long-running; completion is reported
    /// through the returned future.
    fn mark_boot_successful(&mut self) -> LocalBoxFuture<'_, Result<(), anyhow::Error>>;

    /// Resolves a partition name and slot to a device path.
    fn partition_path(&self, name: &str, slot: Slot) -> Result<PathBuf, BootControlError>;
}

/// Test double with settable slot states and partition paths.
#[derive(Debug)]
pub struct FakeBootControl {
    states: Vec<SlotState>,
    current: Slot,
    active: Slot,
    partitions: HashMap<(String, u32), PathBuf>,
    mark_successful_fails: bool,
}

impl FakeBootControl {
    pub fn new(slot_count: u32, current: Slot) -> Self {
        FakeBootControl {
            states: vec![SlotState::Bootable; slot_count as usize],
            current,
            active: current,
            partitions: HashMap::new(),
            mark_successful_fails: false,
        }
    }

    pub fn set_partition_path(&mut self, name: &str, slot: Slot, path: impl Into<PathBuf>) {
        self.partitions.insert((name.to_string(), slot.0), path.into());
    }

    pub fn set_mark_successful_fails(&mut self, fails: bool) {
        self.mark_successful_fails = fails;
    }

    pub fn active_slot(&self) -> Slot {
        self.active
    }

    pub fn slot_state(&self, slot: Slot) -> Option<SlotState> {
        self.states.get(slot.0 as usize).copied()
    }

    fn check_slot(&self, slot: Slot) -> Result<(), BootControlError> {
        if (slot.0 as usize) < self.states.len() {
            Ok(())
        } else {
            Err(BootControlError::InvalidSlot(slot))
        }
    }
}

impl BootControl for FakeBootControl {
    fn slot_count(&self) -> u32 {
        self.states.len() as u32
    }

    fn current_slot(&self) -> Slot {
        self.current
    }

    fn is_bootable(&self, slot: Slot) -> bool {
        matches!(
            self.slot_state(slot),
            Some(SlotState::Bootable) | Some(SlotState::Successful)
        )
    }

    fn is_marked_successful(&self, slot: Slot) -> bool {
        self.slot_state(slot) == Some(SlotState::Successful)
    }

    fn mark_unbootable(&mut self, slot: Slot) -> Result<(), BootControlError> {
        self.check_slot(slot)?;
        if slot == self.current {
            return Err(BootControlError::CurrentSlotProtected(slot));
        }
        self.states[slot.0 as usize] = SlotState::Unbootable;
        Ok(())
    }

    fn set_active_slot(&mut self, slot: Slot) -> Result<(), BootControlError> {
        self.check_slot(slot)?;
        if !self.is_bootable(slot) {
            return Err(BootControlError::Hal(format!("slot {slot} is unbootable")));
        }
        self.active = slot;
        Ok(())
    }

    fn mark_boot_successful(&mut self) -> LocalBoxFuture<'_, Result<(), anyhow::Error>> {
        let result = if self.mark_successful_fails {
            Err(anyhow::anyhow!("mark_boot_successful failed"))
        } else {
            self.states[self.current.0 as usize] = SlotState::Successful;
            Ok(())
        };
        Box::pin(futures::future::ready(result))
    }

    fn partition_path(&self, name: &str, slot: Slot) -> Result<PathBuf, BootControlError> {
        self.check_slot(slot)?;
        self.partitions
            .get(&(name.to_string(), slot.0))
            .cloned()
            .ok_or_else(|| BootControlError::UnknownPartition {
                name: name.to_string(),
                slot,
            })
    }
}
