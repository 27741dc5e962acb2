// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

use std::vec;

use kernel::hil::usb::{CtrlSetupResult, SetupData, Speed, TransferStatus, UsbPipes};
use kernel::ErrorCode;

use super::{buffer, bulk_in, bulk_out, pattern, pattern_vec, DeviceEvent, Harness};
use crate::config::UsbConfig;
use crate::device::CtrlStage;
use crate::registers::offset;

/// `CTSQ` values of the control sequencer.
const IDLE: u16 = 0;
const READ_STATUS: u16 = 2;
const WRITE_STATUS: u16 = 4;

fn device() -> Harness {
    Harness::device(UsbConfig::usb0())
}

fn get_descriptor(h: &Harness, length: u16) {
    h.sim.receive_setup(0x80, 6, 0x0100, 0, length);
    h.pump();
}

#[test]
fn device_state_changes_reach_client() {
    let h = device();
    h.sim.device_state(1);
    h.pump();
    h.sim.set_reg(offset::USBADDR, 5);
    h.sim.device_state(2);
    h.pump();
    h.sim.device_state(3);
    h.pump();
    h.sim.device_state(3 | 4);
    h.pump();
    h.sim.resume_event();
    h.pump();

    assert_eq!(
        h.device_events(),
        vec![
            DeviceEvent::BusReset(Speed::Full),
            DeviceEvent::Address(5),
            DeviceEvent::Configured,
            DeviceEvent::Suspended,
            DeviceEvent::Resumed,
        ]
    );
}

#[test]
fn control_read_request() {
    let h = device();
    get_descriptor(&h, 18);
    assert_eq!(
        h.device_events(),
        vec![DeviceEvent::Setup(SetupData {
            request_type: 0x80,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 18,
        })]
    );
    assert_eq!(h.usb.control_stage(), CtrlStage::DataIn);

    assert!(h.usb.write(0, pattern(18), 18).is_ok());
    h.pump();
    assert_eq!(h.sim.sent(0), vec![pattern_vec(18)]);
    assert_eq!(h.last_done().status, TransferStatus::Complete);

    h.sim.control_stage(READ_STATUS);
    h.pump();
    assert_eq!(h.usb.control_stage(), CtrlStage::StatusStage);
    assert_eq!(h.sim.state.borrow().ccpl_count, 1);

    h.sim.control_stage(IDLE);
    h.pump();
    assert_eq!(h.usb.control_stage(), CtrlStage::Idle);
    assert_eq!(
        h.device_events().last(),
        Some(&DeviceEvent::StatusComplete(TransferStatus::Complete))
    );
}

#[test]
fn shorter_reply_ends_with_zlp() {
    let h = device();
    get_descriptor(&h, 255);
    assert!(h.usb.write(0, pattern(64), 64).is_ok());
    h.pump();
    assert_eq!(h.sim.sent_lengths(0), vec![64, 0]);

    // A reply of exactly wLength needs no terminator.
    let h = device();
    get_descriptor(&h, 64);
    assert!(h.usb.write(0, pattern(64), 64).is_ok());
    h.pump();
    assert_eq!(h.sim.sent_lengths(0), vec![64]);
    assert_eq!(h.last_done().status, TransferStatus::Complete);
}

#[test]
fn request_without_data_stage() {
    let h = device();
    h.sim.receive_setup(0x00, 9, 1, 0, 0);
    h.pump();
    assert_eq!(h.usb.control_stage(), CtrlStage::StatusStage);
    assert_eq!(h.sim.state.borrow().ccpl_count, 1);

    h.sim.control_stage(IDLE);
    h.pump();
    assert_eq!(
        h.device_events(),
        vec![
            DeviceEvent::Setup(SetupData {
                request_type: 0,
                request: 9,
                value: 1,
                index: 0,
                length: 0,
            }),
            DeviceEvent::StatusComplete(TransferStatus::Complete),
        ]
    );
}

#[test]
fn rejected_request_is_stalled() {
    let h = device();
    h.client.setup_answer.set(CtrlSetupResult::Stall);
    get_descriptor(&h, 18);
    assert_eq!(h.usb.control_stage(), CtrlStage::Stalled);
    assert_eq!(h.sim.pid(0), 2);
    assert_eq!(
        h.device_events().last(),
        Some(&DeviceEvent::StatusComplete(TransferStatus::Stalled))
    );

    // The next SETUP clears the stall.
    h.client.setup_answer.set(CtrlSetupResult::Accept);
    get_descriptor(&h, 18);
    assert_eq!(h.usb.control_stage(), CtrlStage::DataIn);
    assert_eq!(h.sim.pid(0), 0);
}

#[test]
fn control_write_request() {
    let h = device();
    h.sim.receive_setup(0x21, 9, 0x0200, 0, 8);
    h.pump();
    assert_eq!(h.usb.control_stage(), CtrlStage::DataOut);

    h.sim.queue_rx(0, &[&pattern_vec(8)]);
    assert!(h.usb.read(0, buffer(8), 8).is_ok());
    h.pump();
    let done = h.last_done();
    assert_eq!((done.pipe, done.status), (0, TransferStatus::Complete));
    assert_eq!(done.data, pattern_vec(8));

    h.sim.control_stage(WRITE_STATUS);
    h.pump();
    h.sim.control_stage(IDLE);
    h.pump();
    assert_eq!(h.sim.state.borrow().ccpl_count, 1);
    assert_eq!(
        h.device_events().last(),
        Some(&DeviceEvent::StatusComplete(TransferStatus::Complete))
    );
}

#[test]
fn pipe_zero_moves_data_only_in_data_stage() {
    let h = device();
    assert!(matches!(h.usb.write(0, buffer(8), 8), Err((ErrorCode::INVAL, _))));
    get_descriptor(&h, 18);
    // The data stage of this request goes to the host.
    assert!(matches!(h.usb.read(0, buffer(8), 8), Err((ErrorCode::INVAL, _))));
    assert!(h.usb.write(0, pattern(8), 8).is_ok());
}

#[test]
fn host_leaving_data_stage_early_stops_transfer() {
    let h = device();
    h.sim.receive_setup(0x21, 9, 0x0200, 0, 8);
    h.pump();
    assert!(h.usb.read(0, buffer(8), 8).is_ok());
    h.pump();

    h.sim.control_stage(WRITE_STATUS);
    h.pump();
    assert_eq!(h.last_done().status, TransferStatus::Stopped);
    assert_eq!(h.usb.control_stage(), CtrlStage::StatusStage);
}

#[test]
fn ctrl_stall_ends_pending_data_stage() {
    let h = device();
    assert_eq!(h.usb.ctrl_stall(), Err(ErrorCode::ALREADY));

    h.sim.receive_setup(0x21, 9, 0x0200, 0, 8);
    h.pump();
    assert!(h.usb.read(0, buffer(8), 8).is_ok());
    h.pump();

    assert_eq!(h.usb.ctrl_stall(), Ok(()));
    assert_eq!(h.last_done().status, TransferStatus::Stalled);
    assert_eq!(h.usb.control_stage(), CtrlStage::Stalled);
    let stalls = h
        .device_events()
        .iter()
        .filter(|e| **e == DeviceEvent::StatusComplete(TransferStatus::Stalled))
        .count();
    assert_eq!(stalls, 1);
    assert_eq!(h.usb.ctrl_stall(), Err(ErrorCode::ALREADY));
}

#[test]
fn remote_wakeup_needs_suspend_and_permission() {
    let h = device();
    assert_eq!(h.usb.remote_wakeup(), Err(ErrorCode::OFF));

    h.sim.device_state(3 | 4);
    h.pump();
    assert_eq!(h.usb.remote_wakeup(), Err(ErrorCode::INVAL));

    h.usb.set_remote_wakeup(true);
    assert_eq!(h.usb.remote_wakeup(), Ok(()));
    assert_ne!(h.sim.reg(offset::DVSTCTR0) & (1 << 8), 0);
}

#[test]
fn pipe_halt_and_toggle_reset() {
    let h = device();
    assert_eq!(h.usb.set_pipe_stall(12, true), Err(ErrorCode::INVAL));
    assert_eq!(h.usb.set_pipe_stall(3, true), Err(ErrorCode::RESERVE));

    // IN endpoints transmit in peripheral mode.
    h.configure(1, bulk_in(1, 64));
    assert!(h.usb.write(1, pattern(10), 10).is_ok());
    h.pump();
    assert!(h.sim.toggle(1));

    assert_eq!(h.usb.set_pipe_stall(1, true), Ok(()));
    assert_eq!(h.sim.pid(1), 2);
    assert_eq!(h.usb.set_pipe_stall(1, false), Ok(()));
    assert_eq!(h.sim.pid(1), 0);
    assert!(!h.sim.toggle(1));

    h.configure(2, bulk_out(2, 64));
    assert!(h.usb.read(2, buffer(64), 64).is_ok());
    assert_eq!(h.usb.set_pipe_stall(2, true), Ok(()));
    let done = h.last_done();
    assert_eq!((done.pipe, done.status), (2, TransferStatus::Stalled));
}

#[test]
fn bus_reset_stops_transfers() {
    let h = device();
    h.configure(2, bulk_out(2, 64));
    assert!(h.usb.read(2, buffer(64), 64).is_ok());
    get_descriptor(&h, 18);

    h.sim.device_state(1);
    h.pump();
    let done = h.last_done();
    assert_eq!((done.pipe, done.status), (2, TransferStatus::Stopped));
    assert_eq!(h.usb.control_stage(), CtrlStage::Idle);
    assert_eq!(
        h.device_events().last(),
        Some(&DeviceEvent::BusReset(Speed::Full))
    );
}
