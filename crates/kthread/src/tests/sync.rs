use core::cell::RefCell;

use critical_section::Mutex;

use crate::platform::{IntrLevel, Interrupts};
use crate::sim::SimPlatform;
use crate::sync::IntrGuard;

#[test]
fn guard_restores_previous_level() {
    let platform = SimPlatform::new();
    platform.enable();
    {
        let _outer = IntrGuard::new(&platform);
        assert_eq!(platform.level(), IntrLevel::Off);
        {
            let _inner = IntrGuard::new(&platform);
        }
        assert_eq!(platform.level(), IntrLevel::Off);
    }
    assert_eq!(platform.level(), IntrLevel::On);
}

#[test]
fn guarded_state_is_shared_across_sections() {
    let platform = SimPlatform::new();
    let counter = Mutex::new(RefCell::new(0u32));
    for _ in 0..3 {
        let guard = IntrGuard::new(&platform);
        *counter.borrow_ref_mut(guard.cs()) += 1;
    }
    let guard = IntrGuard::new(&platform);
    assert_eq!(*counter.borrow_ref(guard.cs()), 3);
}

#[test]
#[should_panic(expected = "borrowed")]
fn nested_borrow_of_guarded_state_panics() {
    let platform = SimPlatform::new();
    let state = Mutex::new(RefCell::new(0u32));
    let guard = IntrGuard::new(&platform);
    let _outer = state.borrow_ref_mut(guard.cs());
    let _inner = state.borrow_ref_mut(guard.cs());
}
