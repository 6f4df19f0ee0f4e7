//! Command-chain processing.
//!
//! One packet is handled at a time in chain order. Handler failures are
//! local: the error code lands in that packet's response and the chain
//! continues, matching the recovery contract of the channel.

use super::{CommandBody, CommandPacket, CommandResponse, DeviceInfo, ResponseBody};
use crate::client::Client;
use crate::device::DeviceKind;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::transaction::TransactionSubmitResult;
use std::sync::Arc;
use tracing::{info, warn};

impl Runtime {
    /// Processes a chain of command packets for one client, returning one
    /// response per packet in order.
    pub async fn process_commands(
        &self,
        client: &Arc<Client>,
        packets: Vec<CommandPacket>,
    ) -> Vec<CommandResponse> {
        let mut responses = Vec::with_capacity(packets.len());
        for packet in packets {
            let cmd_id = packet.header.cmd_id;
            let is_submit = matches!(
                packet.body,
                CommandBody::TransactionSubmit { .. } | CommandBody::TransactionReplace { .. }
            );
            let response = match self.dispatch(client, packet).await {
                Ok(body) => CommandResponse {
                    cmd_id,
                    ret_code: 0,
                    body,
                },
                Err(e) => {
                    warn!(cmd_id, error = %e, "command failed");
                    let body = if is_submit {
                        // Failed submits report the invalid id alongside the
                        // error code.
                        ResponseBody::TransactionSubmitted(TransactionSubmitResult::invalid())
                    } else {
                        ResponseBody::None
                    };
                    CommandResponse {
                        cmd_id,
                        ret_code: e.code(),
                        body,
                    }
                }
            };
            responses.push(response);
        }
        responses
    }

    async fn dispatch(&self, client: &Arc<Client>, packet: CommandPacket) -> Result<ResponseBody> {
        if packet.header.cmd_id != packet.body.id() {
            return Err(Error::InvalidArg("packet header does not match body".into()));
        }
        match packet.body {
            CommandBody::Echo { msg, log } => {
                if log {
                    info!(client = client.id(), "echo: {msg}");
                }
                Ok(ResponseBody::Echo { msg })
            }
            CommandBody::TimeQuery => Ok(ResponseBody::Time {
                timestamp_ns: self.clock().now_ns(),
            }),
            CommandBody::GetDeviceInfo => {
                let device = client.device();
                let mut worker_ids = vec![client.worker_id()];
                if let Some(bus) = self.bus_manager_for(device) {
                    worker_ids.push(bus.worker_id());
                }
                Ok(ResponseBody::DeviceInfo(DeviceInfo {
                    id: device.id(),
                    name: device.name().to_string(),
                    kind: device.kind(),
                    clocks: device.clocks().to_vec(),
                    reg_blocks: device.reg_blocks().to_vec(),
                    worker_ids,
                }))
            }
            CommandBody::DeviceEnable => {
                client.enable_device().await?;
                Ok(ResponseBody::None)
            }
            CommandBody::DeviceDisable => {
                client.disable_device().await?;
                Ok(ResponseBody::None)
            }
            CommandBody::DeviceReset { entries } => {
                client.reset_device(&entries).await?;
                Ok(ResponseBody::None)
            }
            CommandBody::DeviceSuspend => {
                client.suspend_device().await?;
                Ok(ResponseBody::None)
            }
            CommandBody::DeviceResume => {
                client.resume_device().await?;
                Ok(ResponseBody::None)
            }
            CommandBody::DmaBufferEnroll { dma_fd, flags } => Ok(ResponseBody::BufferEnrolled(
                client.enroll_buffer(dma_fd, flags)?,
            )),
            CommandBody::DmaBufferDisenroll { handle } => {
                client.disenroll_buffer(handle)?;
                Ok(ResponseBody::None)
            }
            CommandBody::DmaBufferAlloc { size, flags } => Ok(ResponseBody::BufferAllocated(
                client.alloc_buffer(size, flags)?,
            )),
            CommandBody::DmaBufferFree { handle } => {
                client.free_buffer(handle)?;
                Ok(ResponseBody::None)
            }
            CommandBody::DmaBufferCpuAccess {
                handle,
                offset,
                len,
            } => {
                client.buffer_cpu_access(handle, offset, len)?;
                Ok(ResponseBody::None)
            }
            CommandBody::RegIo { entries } => Ok(ResponseBody::RegIo(client.reg_io(&entries).await?)),
            CommandBody::EventControlGet { event_id } => {
                Ok(ResponseBody::EventControl(client.event_control_get(event_id)))
            }
            CommandBody::EventControlSet { controls } => {
                client.event_control_set(&controls)?;
                Ok(ResponseBody::None)
            }
            CommandBody::EventDequeue { payload_capacity } => {
                Ok(ResponseBody::Event(client.dequeue_event(payload_capacity)?))
            }
            CommandBody::TransactionSubmit { info } => Ok(ResponseBody::TransactionSubmitted(
                client.submit_transaction(info)?,
            )),
            CommandBody::TransactionCancel { id } => {
                client.cancel_transaction(id)?;
                Ok(ResponseBody::None)
            }
            CommandBody::TransactionReplace { info } => Ok(ResponseBody::TransactionSubmitted(
                client.replace_transaction(info)?,
            )),
            CommandBody::PeriodicIoSubmit { info } => Ok(ResponseBody::PeriodicIoSubmitted {
                id: client.submit_periodic_io(info)?,
            }),
            CommandBody::PeriodicIoCancel { id } => {
                client.cancel_periodic_io(id)?;
                Ok(ResponseBody::None)
            }
            CommandBody::DpmClkUpdate { settings } => {
                require_dpm(client)?;
                self.dpm().update_clocks(&settings)?;
                Ok(ResponseBody::None)
            }
            CommandBody::DpmQosUpdate { requests } => {
                require_dpm(client)?;
                self.dpm().update_qos(&requests)?;
                Ok(ResponseBody::None)
            }
            CommandBody::DpmGetClock { device_id } => {
                require_dpm(client)?;
                Ok(ResponseBody::Clock {
                    frequency_hz: self.dpm().clock_hz(device_id)?,
                })
            }
        }
    }
}

fn require_dpm(client: &Arc<Client>) -> Result<()> {
    if client.device().kind() != DeviceKind::Dpm {
        return Err(Error::NotSupported);
    }
    Ok(())
}
