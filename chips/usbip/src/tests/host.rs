// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

use std::vec;

use kernel::hil::usb::{SetupData, Speed, TransferStatus, UsbPipes};
use kernel::hil::usb_host::{LinkState, UsbHost};
use kernel::ErrorCode;

use super::{buffer, bulk_in, pattern, pattern_vec, Harness, LinkEvent};
use crate::config::UsbConfig;
use crate::pipe::{Pid, PipeState};
use crate::registers::offset;

const ATTCH: u16 = 1 << 11;
const DTCH: u16 = 1 << 12;
const BCHG: u16 = 1 << 14;
const OVRCR: u16 = 1 << 15;

const GET_DEVICE_DESCRIPTOR: SetupData = SetupData {
    request_type: 0x80,
    request: 6,
    value: 0x0100,
    index: 0,
    length: 18,
};

const SET_ADDRESS: SetupData = SetupData {
    request_type: 0x00,
    request: 5,
    value: 2,
    index: 0,
    length: 0,
};

#[test]
fn debounce_settles_on_low_speed() {
    let h = Harness::new(UsbConfig::usb0());
    h.usb.set_link_client(h.client);
    // The first sample comes from enable_host; the first debounce pair
    // disagrees.
    h.sim.state.borrow_mut().lnst.extend([1, 1, 2]);
    h.usb.enable_host();
    assert_eq!(h.usb.link_state(0), LinkState::AttachDetecting);
    h.usb.service_link_events();

    assert_eq!(h.usb.link_state(0), LinkState::Attached(Speed::Low));
    assert_eq!(h.link_events(), vec![LinkEvent::Attached(Speed::Low)]);
    assert_eq!(*h.delay.waits.borrow(), vec![10, 10]);
}

#[test]
fn attach_interrupt_starts_debounce() {
    let h = Harness::new(UsbConfig::usb0());
    h.usb.set_link_client(h.client);
    h.usb.enable_host();
    assert_eq!(h.usb.link_state(0), LinkState::Detached);

    h.sim.state.borrow_mut().lnst.push_back(1);
    h.sim.raise1(ATTCH);
    h.pump();
    assert_eq!(h.usb.link_state(0), LinkState::AttachDetecting);
    assert!(h.link_events().is_empty());

    h.usb.service_link_events();
    assert_eq!(h.link_events(), vec![LinkEvent::Attached(Speed::Full)]);
    // Detach is watched from now on, attach is not.
    let enabled = h.sim.reg(offset::INTENB1);
    assert_ne!(enabled & DTCH, 0);
    assert_eq!(enabled & ATTCH, 0);
}

#[test]
fn reset_reports_negotiated_speed() {
    let h = Harness::new(UsbConfig::usbhs());
    h.usb.set_link_client(h.client);
    h.sim.state.borrow_mut().lnst.push_back(1);
    h.usb.enable_host();
    h.usb.service_link_events();
    {
        let mut s = h.sim.state.borrow_mut();
        s.rhst_result = 3;
        s.rhst_busy_reads = 2;
    }
    h.delay.waits.borrow_mut().clear();

    assert_eq!(h.usb.port_reset(0), Ok(Speed::High));
    assert_eq!(h.usb.link_state(0), LinkState::Active(Speed::High));
    assert_eq!(h.link_events().last(), Some(&LinkEvent::Reset(Speed::High)));
    // Reset, two polls while the handshake runs, recovery.
    assert_eq!(*h.delay.waits.borrow(), vec![60, 1, 1, 10]);
}

#[test]
fn reset_fails_when_handshake_never_ends() {
    let h = Harness::new(UsbConfig::usb0());
    h.sim.state.borrow_mut().lnst.push_back(1);
    h.usb.enable_host();
    h.usb.service_link_events();
    h.sim.state.borrow_mut().rhst_result = 4;

    assert_eq!(h.usb.port_reset(0), Err(ErrorCode::FAIL));
    assert_eq!(h.usb.link_state(0), LinkState::Detached);
}

#[test]
fn port_operations_need_a_device() {
    let h = Harness::new(UsbConfig::usb0());
    h.usb.enable_host();
    assert_eq!(h.usb.port_reset(0), Err(ErrorCode::OFF));
    assert_eq!(h.usb.port_suspend(0), Err(ErrorCode::OFF));
    assert_eq!(h.usb.port_resume(0), Err(ErrorCode::OFF));
    assert_eq!(h.usb.port_reset(1), Err(ErrorCode::NODEVICE));
}

#[test]
fn control_read_runs_all_stages() {
    let h = Harness::host(UsbConfig::usb0());
    let descriptor = pattern_vec(18);
    h.sim.queue_rx(0, &[&descriptor]);
    assert!(h
        .usb
        .control_transfer(1, GET_DEVICE_DESCRIPTOR, buffer(64))
        .is_ok());
    h.pump();

    let done = h.last_done();
    assert_eq!((done.pipe, done.length, done.status), (0, 18, TransferStatus::Complete));
    assert_eq!(done.data, descriptor);
    assert_eq!(h.done().len(), 1);
    assert_eq!(h.sim.state.borrow().setups, vec![[0x0680, 0x0100, 0, 18, 1]]);
    // Zero-length OUT status stage.
    assert_eq!(h.sim.sent_lengths(0), vec![0]);
    assert_eq!(h.usb.pipe_state(0), Some(PipeState::Idle));
}

#[test]
fn control_write_runs_all_stages() {
    let h = Harness::host(UsbConfig::usb0());
    let setup = SetupData {
        request_type: 0x21,
        request: 9,
        value: 0x0200,
        index: 0,
        length: 8,
    };
    // Zero-length IN status stage.
    h.sim.queue_rx(0, &[&[]]);
    assert!(h.usb.control_transfer(2, setup, pattern(8)).is_ok());
    h.pump();

    let done = h.last_done();
    assert_eq!((done.length, done.status), (8, TransferStatus::Complete));
    assert_eq!(h.sim.sent(0), vec![pattern_vec(8)]);
    assert_eq!(h.sim.state.borrow().setups[0][4], 2);
}

#[test]
fn control_without_data_stage() {
    let h = Harness::host(UsbConfig::usb0());
    h.sim.queue_rx(0, &[&[]]);
    assert!(h.usb.control_transfer(0, SET_ADDRESS, buffer(0)).is_ok());
    h.pump();

    let done = h.last_done();
    assert_eq!((done.length, done.status), (0, TransferStatus::Complete));
    assert!(h.sim.sent(0).is_empty());
}

#[test]
fn stalled_data_stage_ends_control_transfer() {
    let h = Harness::host(UsbConfig::usb0());
    h.sim.state.borrow_mut().stall_next[0] = true;
    assert!(h
        .usb
        .control_transfer(1, GET_DEVICE_DESCRIPTOR, buffer(64))
        .is_ok());
    h.pump();

    let done = h.last_done();
    assert_eq!((done.length, done.status), (0, TransferStatus::Stalled));
    assert_eq!(h.usb.pipe_pid(0), Some(Pid::Nak));

    h.sim.queue_rx(0, &[&[5; 18]]);
    assert!(h
        .usb
        .control_transfer(1, GET_DEVICE_DESCRIPTOR, buffer(64))
        .is_ok());
    h.pump();
    assert_eq!(h.last_done().status, TransferStatus::Complete);
    assert_eq!(h.last_done().data, vec![5; 18]);
}

#[test]
fn setup_errors_are_retried() {
    let h = Harness::host(UsbConfig::usb0());
    h.sim.state.borrow_mut().sign_budget = 2;
    h.sim.queue_rx(0, &[&[]]);
    assert!(h.usb.control_transfer(0, SET_ADDRESS, buffer(0)).is_ok());
    h.pump();

    assert_eq!(h.last_done().status, TransferStatus::Complete);
    assert_eq!(h.sim.state.borrow().setups.len(), 1);
}

#[test]
fn setup_errors_at_ceiling_fail() {
    let h = Harness::host(UsbConfig::usb0());
    h.sim.state.borrow_mut().sign_budget = 3;
    assert!(h.usb.control_transfer(0, SET_ADDRESS, buffer(0)).is_ok());
    h.pump();

    let done = h.last_done();
    assert_eq!((done.length, done.status), (0, TransferStatus::NotReadyExceeded));
    assert!(h.sim.state.borrow().setups.is_empty());
    assert_eq!(h.usb.pipe_state(0), Some(PipeState::Idle));

    h.sim.queue_rx(0, &[&[]]);
    assert!(h.usb.control_transfer(0, SET_ADDRESS, buffer(0)).is_ok());
    h.pump();
    assert_eq!(h.last_done().status, TransferStatus::Complete);
}

#[test]
fn control_transfer_is_validated() {
    let h = Harness::host(UsbConfig::usb0());
    assert!(matches!(
        h.usb.control_transfer(11, SET_ADDRESS, buffer(0)),
        Err((ErrorCode::INVAL, _))
    ));
    assert!(matches!(
        h.usb.control_transfer(1, GET_DEVICE_DESCRIPTOR, buffer(8)),
        Err((ErrorCode::SIZE, _))
    ));
    // The device never answers the data stage.
    assert!(h
        .usb
        .control_transfer(1, GET_DEVICE_DESCRIPTOR, buffer(64))
        .is_ok());
    h.pump();
    assert!(matches!(
        h.usb.control_transfer(1, SET_ADDRESS, buffer(0)),
        Err((ErrorCode::BUSY, _))
    ));

    h.usb.stop(0);
    assert_eq!(h.last_done().status, TransferStatus::Stopped);
    assert_eq!(h.done().len(), 1);

    let detached = Harness::new(UsbConfig::usb0());
    detached.usb.enable_host();
    assert!(matches!(
        detached.usb.control_transfer(0, SET_ADDRESS, buffer(0)),
        Err((ErrorCode::OFF, _))
    ));
}

#[test]
fn detach_stops_and_releases_pipes() {
    let h = Harness::host(UsbConfig::usb0());
    h.configure(2, bulk_in(2, 64));
    assert!(h.usb.read(2, buffer(64), 64).is_ok());

    h.sim.raise1(DTCH);
    h.pump();

    let done = h.last_done();
    assert_eq!((done.pipe, done.status), (2, TransferStatus::Stopped));
    assert_eq!(h.usb.pipe_state(2), Some(PipeState::Free));
    assert_eq!(h.usb.pipe_state(0), Some(PipeState::Idle));
    assert_eq!(h.usb.link_state(0), LinkState::Detached);
    assert_eq!(h.link_events(), vec![LinkEvent::Detached]);
    let enabled = h.sim.reg(offset::INTENB1);
    assert_ne!(enabled & ATTCH, 0);
    assert_eq!(enabled & DTCH, 0);
    assert_eq!(h.sim.reg(offset::devadd(1)), 0);
}

#[test]
fn overcurrent_reports_and_detaches() {
    let h = Harness::host(UsbConfig::usb0());
    h.sim.raise1(OVRCR);
    h.pump();
    assert_eq!(
        h.link_events(),
        vec![LinkEvent::OverCurrent, LinkEvent::Detached]
    );
    assert_eq!(h.usb.link_state(0), LinkState::Detached);
}

#[test]
fn suspend_and_remote_wakeup() {
    let h = Harness::host(UsbConfig::usb0());
    assert_eq!(h.usb.port_suspend(0), Ok(()));
    assert_eq!(h.usb.link_state(0), LinkState::Suspended);
    assert_eq!(h.link_events(), vec![LinkEvent::Suspended]);

    // The device signals resume.
    h.sim.raise1(BCHG);
    h.pump();
    assert_eq!(h.usb.link_state(0), LinkState::Suspended);
    h.usb.service_link_events();

    assert_eq!(h.usb.link_state(0), LinkState::Active(Speed::Full));
    assert_eq!(
        h.link_events(),
        vec![LinkEvent::Suspended, LinkEvent::Resumed]
    );
    assert_eq!(h.usb.port_resume(0), Err(ErrorCode::OFF));

    // The wakeup was consumed; servicing again changes nothing.
    h.usb.service_link_events();
    assert_eq!(h.link_events().len(), 2);
    assert_eq!(h.usb.link_state(0), LinkState::Active(Speed::Full));
}

#[test]
fn disable_stops_everything() {
    let h = Harness::host(UsbConfig::usb0());
    h.configure(2, bulk_in(2, 64));
    assert!(h.usb.read(2, buffer(64), 64).is_ok());
    h.usb.disable();

    assert_eq!(h.last_done().status, TransferStatus::Stopped);
    assert_eq!(h.usb.mode(), crate::usb::Mode::Off);
    assert_eq!(h.sim.reg(offset::SYSCFG), 0);
    assert!(!h.sim.interrupt_pending());
}
