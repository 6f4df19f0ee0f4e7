//! The per-client command channel.
//!
//! Commands arrive as an ordered chain of packets, each with a header
//! `{cmd_id, next, ret_code}` and a typed body. The runtime processes the
//! chain from the head; a handler-local failure writes the error code into
//! that packet's response and the chain continues, so one bad command does
//! not abort its successors.

mod handlers;

use crate::buffer::{AllocatedBuffer, EnrolledBuffer};
use crate::device::DeviceKind;
use crate::dpm::{ClockSetting, QosRequest};
use crate::event::{DequeueOutcome, EventControl, EventId};
use crate::io_entry::{IoEntry, TransactionResponse};
use crate::periodic::{PeriodicIoId, PeriodicIoInfo};
use crate::transaction::{TransactionId, TransactionInfo, TransactionSubmitResult};
use serde::{Deserialize, Serialize};

pub const CMD_ID_ECHO: u32 = 0x001;
pub const CMD_ID_TIME_QUERY: u32 = 0x002;
pub const CMD_ID_GET_DEVICE_INFO: u32 = 0x003;
pub const CMD_ID_DEVICE_ENABLE: u32 = 0x010;
pub const CMD_ID_DEVICE_DISABLE: u32 = 0x011;
pub const CMD_ID_DEVICE_RESET: u32 = 0x012;
pub const CMD_ID_DEVICE_SUSPEND: u32 = 0x013;
pub const CMD_ID_DEVICE_RESUME: u32 = 0x014;
pub const CMD_ID_DMA_BUFFER_ENROLL: u32 = 0x020;
pub const CMD_ID_DMA_BUFFER_DISENROLL: u32 = 0x021;
pub const CMD_ID_DMA_BUFFER_ALLOC: u32 = 0x022;
pub const CMD_ID_DMA_BUFFER_FREE: u32 = 0x023;
pub const CMD_ID_DMA_BUFFER_CPU_ACCESS: u32 = 0x024;
pub const CMD_ID_REG_IO: u32 = 0x030;
pub const CMD_ID_EVENT_CONTROL_GET: u32 = 0x040;
pub const CMD_ID_EVENT_CONTROL_SET: u32 = 0x041;
pub const CMD_ID_EVENT_DEQUEUE: u32 = 0x042;
pub const CMD_ID_TRANSACTION_SUBMIT: u32 = 0x050;
pub const CMD_ID_TRANSACTION_CANCEL: u32 = 0x051;
pub const CMD_ID_TRANSACTION_REPLACE: u32 = 0x052;
pub const CMD_ID_PERIODIC_IO_SUBMIT: u32 = 0x060;
pub const CMD_ID_PERIODIC_IO_CANCEL: u32 = 0x061;
pub const CMD_ID_DPM_CLK_UPDATE: u32 = 0x070;
pub const CMD_ID_DPM_QOS_UPDATE: u32 = 0x071;
pub const CMD_ID_DPM_GET_CLOCK: u32 = 0x072;

/// Packet header shared by every command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHeader {
    pub cmd_id: u32,
    /// Whether another packet follows in the chain.
    pub next: bool,
    /// Filled by the runtime in the response; 0 on success.
    pub ret_code: i32,
}

/// One command packet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandPacket {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl CommandPacket {
    pub fn new(body: CommandBody) -> Self {
        Self {
            header: CommandHeader {
                cmd_id: body.id(),
                next: false,
                ret_code: 0,
            },
            body,
        }
    }

    /// Builds a chain of packets with the `next` links set.
    pub fn chain(bodies: Vec<CommandBody>) -> Vec<CommandPacket> {
        let count = bodies.len();
        bodies
            .into_iter()
            .enumerate()
            .map(|(index, body)| {
                let mut packet = CommandPacket::new(body);
                packet.header.next = index + 1 < count;
                packet
            })
            .collect()
    }
}

/// Typed body of a command packet. The complete command surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommandBody {
    Echo { msg: String, log: bool },
    TimeQuery,
    GetDeviceInfo,
    DeviceEnable,
    DeviceDisable,
    DeviceReset { entries: Vec<IoEntry> },
    DeviceSuspend,
    DeviceResume,
    DmaBufferEnroll { dma_fd: i32, flags: u32 },
    DmaBufferDisenroll { handle: u64 },
    DmaBufferAlloc { size: usize, flags: u32 },
    DmaBufferFree { handle: u64 },
    DmaBufferCpuAccess { handle: u64, offset: usize, len: usize },
    RegIo { entries: Vec<IoEntry> },
    EventControlGet { event_id: EventId },
    EventControlSet { controls: Vec<EventControl> },
    EventDequeue { payload_capacity: usize },
    TransactionSubmit { info: TransactionInfo },
    TransactionCancel { id: TransactionId },
    TransactionReplace { info: TransactionInfo },
    PeriodicIoSubmit { info: PeriodicIoInfo },
    PeriodicIoCancel { id: PeriodicIoId },
    DpmClkUpdate { settings: Vec<ClockSetting> },
    DpmQosUpdate { requests: Vec<QosRequest> },
    DpmGetClock { device_id: u32 },
}

impl CommandBody {
    pub fn id(&self) -> u32 {
        match self {
            CommandBody::Echo { .. } => CMD_ID_ECHO,
            CommandBody::TimeQuery => CMD_ID_TIME_QUERY,
            CommandBody::GetDeviceInfo => CMD_ID_GET_DEVICE_INFO,
            CommandBody::DeviceEnable => CMD_ID_DEVICE_ENABLE,
            CommandBody::DeviceDisable => CMD_ID_DEVICE_DISABLE,
            CommandBody::DeviceReset { .. } => CMD_ID_DEVICE_RESET,
            CommandBody::DeviceSuspend => CMD_ID_DEVICE_SUSPEND,
            CommandBody::DeviceResume => CMD_ID_DEVICE_RESUME,
            CommandBody::DmaBufferEnroll { .. } => CMD_ID_DMA_BUFFER_ENROLL,
            CommandBody::DmaBufferDisenroll { .. } => CMD_ID_DMA_BUFFER_DISENROLL,
            CommandBody::DmaBufferAlloc { .. } => CMD_ID_DMA_BUFFER_ALLOC,
            CommandBody::DmaBufferFree { .. } => CMD_ID_DMA_BUFFER_FREE,
            CommandBody::DmaBufferCpuAccess { .. } => CMD_ID_DMA_BUFFER_CPU_ACCESS,
            CommandBody::RegIo { .. } => CMD_ID_REG_IO,
            CommandBody::EventControlGet { .. } => CMD_ID_EVENT_CONTROL_GET,
            CommandBody::EventControlSet { .. } => CMD_ID_EVENT_CONTROL_SET,
            CommandBody::EventDequeue { .. } => CMD_ID_EVENT_DEQUEUE,
            CommandBody::TransactionSubmit { .. } => CMD_ID_TRANSACTION_SUBMIT,
            CommandBody::TransactionCancel { .. } => CMD_ID_TRANSACTION_CANCEL,
            CommandBody::TransactionReplace { .. } => CMD_ID_TRANSACTION_REPLACE,
            CommandBody::PeriodicIoSubmit { .. } => CMD_ID_PERIODIC_IO_SUBMIT,
            CommandBody::PeriodicIoCancel { .. } => CMD_ID_PERIODIC_IO_CANCEL,
            CommandBody::DpmClkUpdate { .. } => CMD_ID_DPM_CLK_UPDATE,
            CommandBody::DpmQosUpdate { .. } => CMD_ID_DPM_QOS_UPDATE,
            CommandBody::DpmGetClock { .. } => CMD_ID_DPM_GET_CLOCK,
        }
    }
}

/// Response to one packet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub cmd_id: u32,
    /// 0 on success, otherwise the failing handler's error code.
    pub ret_code: i32,
    pub body: ResponseBody,
}

/// Typed response payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResponseBody {
    None,
    Echo { msg: String },
    Time { timestamp_ns: i64 },
    DeviceInfo(DeviceInfo),
    BufferEnrolled(EnrolledBuffer),
    BufferAllocated(AllocatedBuffer),
    RegIo(TransactionResponse),
    EventControl(EventControl),
    Event(DequeueOutcome),
    TransactionSubmitted(TransactionSubmitResult),
    PeriodicIoSubmitted { id: PeriodicIoId },
    Clock { frequency_hz: u64 },
}

/// Payload of a `GetDeviceInfo` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u32,
    pub name: String,
    pub kind: DeviceKind,
    pub clocks: Vec<String>,
    pub reg_blocks: Vec<String>,
    /// Workers servicing this client: its scheduler worker and, for
    /// bus-attached devices, the bus worker.
    pub worker_ids: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_sets_next_links() {
        let packets = CommandPacket::chain(vec![
            CommandBody::TimeQuery,
            CommandBody::GetDeviceInfo,
            CommandBody::DeviceEnable,
        ]);
        assert_eq!(packets.len(), 3);
        assert!(packets[0].header.next);
        assert!(packets[1].header.next);
        assert!(!packets[2].header.next);
        assert_eq!(packets[0].header.cmd_id, CMD_ID_TIME_QUERY);
    }

    #[test]
    fn packets_round_trip_through_json() {
        let packet = CommandPacket::new(CommandBody::TransactionSubmit {
            info: crate::transaction::TransactionInfo::immediate(vec![
                crate::io_entry::IoEntry::Write {
                    offset: 0x100,
                    value: 0xDEAD,
                },
            ]),
        });
        let raw = serde_json::to_string(&packet).unwrap();
        let parsed: CommandPacket = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.header, packet.header);
        assert_eq!(parsed.body.id(), CMD_ID_TRANSACTION_SUBMIT);
    }

    #[test]
    fn body_ids_are_distinct() {
        let bodies = [
            CommandBody::TimeQuery,
            CommandBody::GetDeviceInfo,
            CommandBody::DeviceEnable,
            CommandBody::DeviceDisable,
            CommandBody::DeviceSuspend,
            CommandBody::DeviceResume,
        ];
        let mut ids: Vec<u32> = bodies.iter().map(|b| b.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), bodies.len());
    }
}
