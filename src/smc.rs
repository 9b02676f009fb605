//! Virtualization calls from the secure monitor
//!
//! Translates the registry results into SMC return values. Fatal errors mean the hypervisor broke
//! the guest life cycle, the TEE halts on them.

use virtualization::{GuestId, GuestRegistry, Platform, VirtError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SmcReturn {
    Ok = 0x0,
    ENotAvail = 0x7,
}

fn fatal(err: VirtError) -> ! {
    log::error!("Unrecoverable guest state: {:?}", err);
    panic!("Virtualization failure: {:?}", err);
}

pub fn guest_created<P: Platform>(registry: &GuestRegistry<P>, guest_id: GuestId) -> SmcReturn {
    match registry.guest_created(guest_id) {
        Ok(()) => SmcReturn::Ok,
        Err(err) if err.is_fatal() => fatal(err),
        Err(err) => {
            log::error!("Can't create guest {}: {:?}", guest_id, err);
            SmcReturn::ENotAvail
        }
    }
}

pub fn guest_destroyed<P: Platform>(registry: &GuestRegistry<P>, guest_id: GuestId) -> SmcReturn {
    if let Err(err) = registry.guest_destroyed(guest_id) {
        fatal(err);
    }
    SmcReturn::Ok
}

/// Returns false if the guest is unknown.
pub fn set_guest<P: Platform>(registry: &GuestRegistry<P>, guest_id: GuestId) -> bool {
    match registry.set_guest(guest_id) {
        Ok(()) => true,
        Err(err) if err.is_fatal() => fatal(err),
        Err(_) => false,
    }
}

pub fn unset_guest<P: Platform>(registry: &GuestRegistry<P>) {
    if let Err(err) = registry.unset_guest() {
        fatal(err);
    }
}

pub fn on_std_call<P: Platform>(registry: &GuestRegistry<P>) {
    if let Err(err) = registry.on_std_call() {
        fatal(err);
    }
}
