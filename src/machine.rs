//! Session state machine.
//!
//! [`SessionMachine`] holds everything a session run decides: status,
//! discovery progress, the command queue and the sequence counter. It performs
//! no I/O. Each event (`start`, `connection_opened`, `packet_received`,
//! `write_requested`, `connection_closed`) returns the [`Action`]s the driver
//! must carry out, in order. After carrying them out the driver reads the next
//! packet, unless one of them was [`Action::Finish`].
//!
//! ```text
//! Disconnected -> Connecting -> Configuring -> Connected -> Disconnected
//! ```

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::{
    error::{DirconError, Result},
    protocol::{MessageId, Packet, ResponseCode},
    types::{RunTargets, SessionStatus},
};

/// Characteristic value delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicEvent {
    /// Characteristic short id
    pub uuid: u32,
    /// Characteristic value
    pub payload: Bytes,
    /// Message that carried the value
    pub message_id: MessageId,
}

/// Why a run stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    /// Every command was answered and listening was not requested
    Completed,
    /// Discovery left nothing to read or subscribe to
    ConfigurationFailed(String),
    /// Device answered with a non-success response code
    DeviceError {
        /// Message the failed response belongs to
        message_id: MessageId,
        /// Response code reported
        code: ResponseCode,
    },
}

impl RunEnd {
    /// Convert into the error the run is reported with
    ///
    /// # Errors
    ///
    /// Returns [`DirconError::Configuration`] or [`DirconError::Device`] for
    /// runs that did not complete.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::ConfigurationFailed(reason) => Err(DirconError::Configuration(reason)),
            Self::DeviceError { code, .. } => Err(DirconError::Device { code }),
        }
    }
}

/// Work the driver has to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Publish a status change
    SetStatus(SessionStatus),
    /// Send a packet to the device
    Send(Packet),
    /// Hand a characteristic value to the listeners
    Dispatch(CharacteristicEvent),
    /// Stop the run
    Finish(RunEnd),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening,
    DiscoveringServices,
    DiscoveringCharacteristics { pending: VecDeque<u32> },
    Running,
}

/// Sans-IO state of one protocol session
#[derive(Debug, Clone)]
pub struct SessionMachine {
    status: SessionStatus,
    phase: Phase,
    sequence: u8,
    targets: RunTargets,
    commands: VecDeque<Packet>,
    outstanding: bool,
    configured: bool,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    /// Create a disconnected machine
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            phase: Phase::Idle,
            sequence: 0,
            targets: RunTargets::default(),
            commands: VecDeque::new(),
            outstanding: false,
            configured: false,
        }
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether discovery of the current or last run produced commands
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.configured
    }

    /// Whether the next read is an open-ended wait for notifications
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::Running && !self.outstanding
    }

    /// Commands still waiting to be sent
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn set_status(&mut self, status: SessionStatus, actions: &mut Vec<Action>) {
        self.status = status;
        actions.push(Action::SetStatus(status));
    }

    fn send(&mut self, packet: Packet, actions: &mut Vec<Action>) {
        self.outstanding = true;
        actions.push(Action::Send(packet));
    }

    /// Begin a run
    pub fn start(&mut self, targets: RunTargets) -> Vec<Action> {
        let mut actions = Vec::new();
        self.targets = targets;
        self.commands.clear();
        self.outstanding = false;
        self.configured = false;
        self.phase = Phase::Opening;
        self.set_status(SessionStatus::Connecting, &mut actions);
        actions
    }

    /// The TCP connection is open: start discovery
    pub fn connection_opened(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Opening {
            warn!("Connection opened outside of a run");
            return actions;
        }

        self.phase = Phase::DiscoveringServices;
        self.set_status(SessionStatus::Configuring, &mut actions);
        let request = Packet::discover_services(self.next_sequence());
        self.send(request, &mut actions);
        actions
    }

    /// A packet arrived from the device
    pub fn packet_received(&mut self, packet: Packet) -> Vec<Action> {
        let mut actions = Vec::new();
        self.outstanding = false;

        if !packet.is_success() {
            warn!(
                "Invalid response received: {:?} 0x{:02X}",
                packet.message_id,
                u8::from(packet.response_code)
            );
            actions.push(Action::Finish(RunEnd::DeviceError {
                message_id: packet.message_id,
                code: packet.response_code,
            }));
            return actions;
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::DiscoveringServices => {
                for service in &packet.uuids {
                    debug!("Discovered service: 0x{service:04X}");
                }
                self.phase = Phase::DiscoveringCharacteristics {
                    pending: packet.uuids.into_iter().collect(),
                };
                self.discover_next_service(&mut actions);
            }
            Phase::DiscoveringCharacteristics { pending } => {
                self.enqueue_commands(&packet);
                self.phase = Phase::DiscoveringCharacteristics { pending };
                self.discover_next_service(&mut actions);
            }
            Phase::Running => {
                self.phase = Phase::Running;
                Self::dispatch(packet, &mut actions);
                if let Some(command) = self.commands.pop_front() {
                    debug!("Sending next command");
                    self.send(command, &mut actions);
                } else if !self.targets.listen {
                    actions.push(Action::Finish(RunEnd::Completed));
                }
            }
            phase @ (Phase::Idle | Phase::Opening) => {
                warn!("Ignoring packet outside of a run: {:?}", packet.message_id);
                self.phase = phase;
            }
        }

        actions
    }

    fn discover_next_service(&mut self, actions: &mut Vec<Action>) {
        let next = match &mut self.phase {
            Phase::DiscoveringCharacteristics { pending } => pending.pop_front(),
            _ => None,
        };

        if let Some(service) = next {
            let request = Packet::discover_characteristics(self.next_sequence(), service);
            self.send(request, actions);
            return;
        }

        if self.commands.is_empty() {
            warn!("Discovery found no characteristic to read or subscribe to");
            self.phase = Phase::Idle;
            actions.push(Action::Finish(RunEnd::ConfigurationFailed(
                "no readable or notifiable target characteristic".to_string(),
            )));
            return;
        }

        info!("Configured {} command(s)", self.commands.len());
        self.configured = true;
        self.phase = Phase::Running;
        self.set_status(SessionStatus::Connected, actions);
        if let Some(command) = self.commands.pop_front() {
            self.send(command, actions);
        }
    }

    fn enqueue_commands(&mut self, packet: &Packet) {
        let discovered: Vec<_> = packet.characteristics().collect();
        for (uuid, properties) in discovered {
            debug!("Discovered characteristic: 0x{uuid:04X}, flags 0x{:02X}", properties.0);
            if self.targets.read.contains(&uuid) && properties.can_read() {
                debug!("Request read: 0x{uuid:04X}");
                let command = Packet::read_characteristic(self.next_sequence(), uuid);
                self.commands.push_back(command);
            }
            if self.targets.notify.contains(&uuid) && properties.can_notify() {
                debug!("Request notify: 0x{uuid:04X}");
                let command = Packet::enable_notifications(self.next_sequence(), uuid);
                self.commands.push_back(command);
            }
        }
    }

    fn dispatch(packet: Packet, actions: &mut Vec<Action>) {
        if !matches!(
            packet.message_id,
            MessageId::ReadCharacteristic
                | MessageId::WriteCharacteristic
                | MessageId::UnsolicitedNotification
        ) {
            return;
        }
        if let Some(uuid) = packet.uuid() {
            debug!(
                "Process message: {:?} 0x{uuid:04X}: {:02X?}",
                packet.message_id, packet.payload
            );
            actions.push(Action::Dispatch(CharacteristicEvent {
                uuid,
                payload: packet.payload,
                message_id: packet.message_id,
            }));
        }
    }

    /// Build a characteristic write if the session is connected
    pub fn write_requested(&mut self, uuid: u32, payload: Bytes) -> Option<Packet> {
        if self.status != SessionStatus::Connected {
            return None;
        }
        Some(Packet::write_characteristic(
            self.next_sequence(),
            uuid,
            payload,
        ))
    }

    /// The connection is gone, for whatever reason
    pub fn connection_closed(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.phase = Phase::Idle;
        self.outstanding = false;
        self.commands.clear();
        if self.status != SessionStatus::Disconnected {
            self.set_status(SessionStatus::Disconnected, &mut actions);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CharacteristicProperties, PROTOCOL_VERSION};
    use std::collections::BTreeSet;

    const SERVICE_FTMS: u32 = 0x1826;
    const SERVICE_RSC: u32 = 0x1814;

    fn response(message_id: MessageId, uuids: Vec<u32>, payload: &[u8]) -> Packet {
        Packet {
            version: PROTOCOL_VERSION,
            message_id,
            sequence: 0,
            response_code: ResponseCode::Success,
            uuids,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn services(uuids: Vec<u32>) -> Packet {
        response(MessageId::DiscoverServices, uuids, &[])
    }

    fn characteristics(chars: &[(u32, u8)]) -> Packet {
        let uuids = chars.iter().map(|(uuid, _)| *uuid).collect();
        let flags: Vec<u8> = chars.iter().map(|(_, flags)| *flags).collect();
        response(MessageId::DiscoverCharacteristics, uuids, &flags)
    }

    fn targets(read: &[u32], notify: &[u32], listen: bool) -> RunTargets {
        RunTargets {
            read: read.iter().copied().collect::<BTreeSet<_>>(),
            notify: notify.iter().copied().collect::<BTreeSet<_>>(),
            listen,
        }
    }

    fn sent(actions: &[Action]) -> Vec<&Packet> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(packet) => Some(packet),
                _ => None,
            })
            .collect()
    }

    fn configured_machine(listen: bool) -> SessionMachine {
        let mut machine = SessionMachine::new();
        machine.start(targets(&[0x2ACC], &[0x2ACD], listen));
        machine.connection_opened();
        machine.packet_received(services(vec![SERVICE_FTMS]));
        machine.packet_received(characteristics(&[
            (0x2ACC, CharacteristicProperties::READ),
            (0x2ACD, CharacteristicProperties::NOTIFY),
        ]));
        machine
    }

    #[test]
    fn test_discovery_handshake() {
        let mut machine = SessionMachine::new();

        let actions = machine.start(targets(&[0x2ACC], &[0x2ACD], true));
        assert_eq!(actions, vec![Action::SetStatus(SessionStatus::Connecting)]);

        let actions = machine.connection_opened();
        assert_eq!(actions[0], Action::SetStatus(SessionStatus::Configuring));
        assert_eq!(sent(&actions)[0].message_id, MessageId::DiscoverServices);

        let actions = machine.packet_received(services(vec![SERVICE_FTMS, SERVICE_RSC]));
        let requests = sent(&actions);
        assert_eq!(requests[0].message_id, MessageId::DiscoverCharacteristics);
        assert_eq!(requests[0].uuids, vec![SERVICE_FTMS]);

        let actions = machine.packet_received(characteristics(&[
            (0x2ACC, CharacteristicProperties::READ),
            (0x2ACD, CharacteristicProperties::NOTIFY),
        ]));
        assert_eq!(sent(&actions)[0].uuids, vec![SERVICE_RSC]);
        assert_eq!(machine.status(), SessionStatus::Configuring);

        let actions = machine.packet_received(characteristics(&[]));
        assert_eq!(actions[0], Action::SetStatus(SessionStatus::Connected));
        let requests = sent(&actions);
        assert_eq!(requests[0].message_id, MessageId::ReadCharacteristic);
        assert_eq!(requests[0].uuids, vec![0x2ACC]);
        assert!(machine.is_configured());
        assert_eq!(machine.pending_commands(), 1);
    }

    #[test]
    fn test_commands_follow_property_bits_and_discovery_order() {
        let mut machine = SessionMachine::new();
        machine.start(targets(&[0x2ACC, 0x2AD3], &[0x2ACD, 0x2AD3], true));
        machine.connection_opened();
        machine.packet_received(services(vec![SERVICE_FTMS]));
        let actions = machine.packet_received(characteristics(&[
            (0x2AD3, CharacteristicProperties::READ | CharacteristicProperties::NOTIFY),
            // targeted for read but cannot be read
            (0x2ACC, CharacteristicProperties::WRITE),
            (0x2ACD, CharacteristicProperties::NOTIFY),
            (0x2AD9, CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY),
        ]));

        let first = sent(&actions)[0];
        assert_eq!(first.message_id, MessageId::ReadCharacteristic);
        assert_eq!(first.uuids, vec![0x2AD3]);
        assert_eq!(machine.pending_commands(), 2);

        let actions = machine.packet_received(response(
            MessageId::ReadCharacteristic,
            vec![0x2AD3],
            &[0x01],
        ));
        let second = sent(&actions)[0];
        assert_eq!(second.message_id, MessageId::EnableNotifications);
        assert_eq!(second.uuids, vec![0x2AD3]);

        let actions = machine.packet_received(response(
            MessageId::EnableNotifications,
            vec![0x2AD3],
            &[],
        ));
        let third = sent(&actions)[0];
        assert_eq!(third.message_id, MessageId::EnableNotifications);
        assert_eq!(third.uuids, vec![0x2ACD]);
    }

    #[test]
    fn test_no_services_is_a_configuration_failure() {
        let mut machine = SessionMachine::new();
        machine.start(targets(&[0x2ACC], &[], false));
        machine.connection_opened();

        let actions = machine.packet_received(services(Vec::new()));

        assert!(matches!(
            actions.last(),
            Some(Action::Finish(RunEnd::ConfigurationFailed(_)))
        ));
        assert!(!machine.is_configured());
        assert_eq!(machine.status(), SessionStatus::Configuring);

        let actions = machine.connection_closed();
        assert_eq!(actions, vec![Action::SetStatus(SessionStatus::Disconnected)]);
    }

    #[test]
    fn test_failed_discovery_aborts() {
        let mut machine = SessionMachine::new();
        machine.start(targets(&[0x2ACC], &[], false));
        machine.connection_opened();
        machine.packet_received(services(vec![SERVICE_FTMS]));

        let mut failure = characteristics(&[]);
        failure.response_code = ResponseCode::ServiceNotFound;
        let actions = machine.packet_received(failure);

        assert_eq!(
            actions,
            vec![Action::Finish(RunEnd::DeviceError {
                message_id: MessageId::DiscoverCharacteristics,
                code: ResponseCode::ServiceNotFound,
            })]
        );
        assert!(!machine.is_configured());
    }

    #[test]
    fn test_probe_run_completes_after_last_response() {
        let mut machine = configured_machine(false);

        let actions = machine.packet_received(response(
            MessageId::ReadCharacteristic,
            vec![0x2ACC],
            &[0x04, 0x04],
        ));
        assert!(matches!(actions[0], Action::Dispatch(ref event) if event.uuid == 0x2ACC));
        assert_eq!(sent(&actions)[0].message_id, MessageId::EnableNotifications);

        let actions = machine.packet_received(response(
            MessageId::EnableNotifications,
            vec![0x2ACD],
            &[],
        ));
        assert_eq!(actions, vec![Action::Finish(RunEnd::Completed)]);
    }

    #[test]
    fn test_streaming_keeps_reading() {
        let mut machine = configured_machine(true);
        machine.packet_received(response(MessageId::ReadCharacteristic, vec![0x2ACC], &[]));
        machine.packet_received(response(MessageId::EnableNotifications, vec![0x2ACD], &[]));
        assert!(machine.is_streaming());

        for _ in 0..3 {
            let actions = machine.packet_received(response(
                MessageId::UnsolicitedNotification,
                vec![0x2ACD],
                &[0x00, 0x00, 0x64, 0x00],
            ));
            assert_eq!(actions.len(), 1);
            assert!(matches!(actions[0], Action::Dispatch(_)));
        }

        let mut failure = response(MessageId::Error, Vec::new(), &[]);
        failure.response_code = ResponseCode::UnexpectedError;
        let actions = machine.packet_received(failure);
        assert!(matches!(actions[0], Action::Finish(RunEnd::DeviceError { .. })));
        assert!(machine.is_configured());
    }

    #[test]
    fn test_dispatch_precedes_next_command() {
        let mut machine = configured_machine(true);
        let actions = machine.packet_received(response(
            MessageId::ReadCharacteristic,
            vec![0x2ACC],
            &[0x01],
        ));
        assert!(matches!(actions[0], Action::Dispatch(_)));
        assert!(matches!(actions[1], Action::Send(_)));
    }

    #[test]
    fn test_write_only_when_connected() {
        let mut machine = SessionMachine::new();
        assert!(machine
            .write_requested(0x2AD9, Bytes::from_static(&[0x02]))
            .is_none());

        let mut machine = configured_machine(true);
        let packet = machine
            .write_requested(0x2AD9, Bytes::from_static(&[0x02, 0xCE, 0x04]))
            .unwrap();
        assert_eq!(packet.message_id, MessageId::WriteCharacteristic);
        assert_eq!(packet.uuids, vec![0x2AD9]);

        machine.connection_closed();
        assert!(machine
            .write_requested(0x2AD9, Bytes::from_static(&[0x02]))
            .is_none());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut machine = configured_machine(true);
        let mut last = machine.write_requested(0x2AD9, Bytes::new()).unwrap().sequence;
        for _ in 0..300 {
            let sequence = machine.write_requested(0x2AD9, Bytes::new()).unwrap().sequence;
            assert_eq!(sequence, last.wrapping_add(1));
            last = sequence;
        }
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let mut machine = SessionMachine::new();
        machine.start(targets(&[0x2ACC], &[], false));
        let actions = machine.connection_opened();
        assert_eq!(sent(&actions)[0].sequence, 1);
    }

    #[test]
    fn test_run_end_results() {
        assert!(RunEnd::Completed.into_result().is_ok());
        assert!(matches!(
            RunEnd::ConfigurationFailed("empty".to_string()).into_result(),
            Err(DirconError::Configuration(_))
        ));
        assert!(matches!(
            RunEnd::DeviceError {
                message_id: MessageId::ReadCharacteristic,
                code: ResponseCode::CharacteristicNotFound,
            }
            .into_result(),
            Err(DirconError::Device {
                code: ResponseCode::CharacteristicNotFound
            })
        ));
    }

    #[test]
    fn test_closed_is_idempotent() {
        let mut machine = configured_machine(true);
        assert_eq!(
            machine.connection_closed(),
            vec![Action::SetStatus(SessionStatus::Disconnected)]
        );
        assert!(machine.connection_closed().is_empty());
    }
}
