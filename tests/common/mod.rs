//! Fake DIRCON device on loopback TCP

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use dircon::protocol::{expand_uuid, short_uuid, CharacteristicProperties, HEADER_SIZE};

pub const SERVICE_FTMS: u32 = 0x1826;
pub const SERVICE_RSC: u32 = 0x1814;

pub const READ: u8 = CharacteristicProperties::READ;
pub const WRITE: u8 = CharacteristicProperties::WRITE;
pub const NOTIFY: u8 = CharacteristicProperties::NOTIFY;

/// What the fake device exposes and how it behaves
#[derive(Debug, Clone, Default)]
pub struct DeviceModel {
    /// Services with their characteristics and property flags
    pub services: Vec<(u32, Vec<(u32, u8)>)>,
    /// Values answered to read requests
    pub values: HashMap<u32, Vec<u8>>,
    /// Pushed once `subscriptions` notifications have been enabled
    pub notifications: Vec<(u32, Vec<u8>)>,
    pub subscriptions: usize,
    /// Answer the first request with this message id using this response code
    pub fail: Option<(u8, u8)>,
}

impl DeviceModel {
    /// FTMS treadmill with RSC, laid out so the last command is a subscription
    pub fn treadmill() -> Self {
        Self {
            services: vec![
                (
                    SERVICE_FTMS,
                    vec![
                        (0x2ACC, READ),
                        (0x2ACD, NOTIFY),
                        (0x2AD9, WRITE | NOTIFY),
                    ],
                ),
                (SERVICE_RSC, vec![(0x2A54, READ), (0x2A53, NOTIFY)]),
            ],
            values: HashMap::from([
                // cadence, distance, incline, hrm; speed_set and incline_set
                (
                    0x2ACC,
                    vec![0x0E, 0x04, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00],
                ),
                // stride, distance
                (0x2A54, vec![0x03, 0x00]),
            ]),
            notifications: Vec::new(),
            subscriptions: 2,
            fail: None,
        }
    }
}

/// Request as seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub message_id: u8,
    pub sequence: u8,
    pub uuid: Option<u32>,
    pub payload: Vec<u8>,
}

pub struct FakeDevice {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<Request>>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    /// Accept connections one at a time and serve `model` on each
    pub async fn start(model: DeviceModel) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                serve(stream, &model, &log).await;
            }
        });

        Self {
            port,
            requests,
            task,
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|request| request.message_id == 0x04)
            .collect()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn uuid_block(short: u32) -> Vec<u8> {
    expand_uuid(short).as_bytes().to_vec()
}

pub fn frame(message_id: u8, sequence: u8, code: u8, body: &[u8]) -> Vec<u8> {
    let len = u16::try_from(body.len()).unwrap().to_be_bytes();
    let mut bytes = vec![0x01, message_id, sequence, code, len[0], len[1]];
    bytes.extend_from_slice(body);
    bytes
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.ok()?;
    let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;

    let uuid = body.get(..16).and_then(|block| {
        let block: [u8; 16] = block.try_into().ok()?;
        short_uuid(&uuid::Uuid::from_bytes(block))
    });
    Some(Request {
        message_id: header[1],
        sequence: header[2],
        uuid,
        payload: body.get(16..).unwrap_or_default().to_vec(),
    })
}

async fn serve(mut stream: TcpStream, model: &DeviceModel, log: &Mutex<Vec<Request>>) {
    let mut fail = model.fail;
    let mut enabled = 0;

    while let Some(request) = read_request(&mut stream).await {
        log.lock().unwrap().push(request.clone());
        let id = request.message_id;
        let seq = request.sequence;

        if let Some((fail_id, code)) = fail {
            if fail_id == id {
                fail = None;
                if stream.write_all(&frame(id, seq, code, &[])).await.is_err() {
                    return;
                }
                continue;
            }
        }

        let mut reply = Vec::new();
        match id {
            0x01 => {
                for (service, _) in &model.services {
                    reply.extend(uuid_block(*service));
                }
                reply = frame(id, seq, 0, &reply);
            }
            0x02 => {
                let service = request.uuid.unwrap_or_default();
                reply.extend(uuid_block(service));
                if let Some((_, chars)) = model.services.iter().find(|(s, _)| *s == service) {
                    for (uuid, flags) in chars {
                        reply.extend(uuid_block(*uuid));
                        reply.push(*flags);
                    }
                }
                reply = frame(id, seq, 0, &reply);
            }
            0x03 => {
                let uuid = request.uuid.unwrap_or_default();
                reply.extend(uuid_block(uuid));
                reply.extend(model.values.get(&uuid).cloned().unwrap_or_default());
                reply = frame(id, seq, 0, &reply);
            }
            0x04 => {
                reply.extend(uuid_block(request.uuid.unwrap_or_default()));
                reply.extend(&request.payload);
                reply = frame(id, seq, 0, &reply);
            }
            0x05 => {
                reply = frame(id, seq, 0, &uuid_block(request.uuid.unwrap_or_default()));
                enabled += 1;
                if enabled == model.subscriptions {
                    for (uuid, payload) in &model.notifications {
                        let mut body = uuid_block(*uuid);
                        body.extend(payload);
                        reply.extend(frame(0x06, 0, 0, &body));
                    }
                }
            }
            _ => reply = frame(0xFF, seq, 0x04, &[]),
        }

        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
