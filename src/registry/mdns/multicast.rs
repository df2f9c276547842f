//! Multicast DNS over UDP (`224.0.0.251:5353`).
//!
//! One socket per transport answers lookups for the local zone, issues
//! lookups, and feeds every response it hears to subscribers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, AAAA, PTR, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::zone::{MdnsTransport, QueryParams, ServiceEntry, ServiceRecord};
use crate::{Error, Result};

/// mDNS IPv4 group.
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// mDNS port.
pub const MDNS_PORT: u16 = 5353;

const MAX_PACKET: usize = 9000;

/// UDP multicast transport.
pub struct MulticastTransport {
    zone: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    socket: Arc<UdpSocket>,
    events: broadcast::Sender<ServiceEntry>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl MulticastTransport {
    /// Bind the shared mDNS socket and start answering lookups.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind() -> Result<Self> {
        let socket = Arc::new(bind_socket()?);
        let zone = Arc::new(RwLock::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            Arc::clone(&zone),
            events.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            zone,
            socket,
            events,
            shutdown,
            task,
        })
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg
            .to_vec()
            .map_err(|e| Error::discovery(format!("encode dns message: {e}")))?;
        self.socket
            .send_to(&bytes, SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT))
            .await?;
        Ok(())
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

#[async_trait]
impl MdnsTransport for MulticastTransport {
    async fn announce(&self, record: ServiceRecord) -> Result<()> {
        let msg = response_for(&record, record.ttl, true)?;
        debug!(name = %record.instance_addr(), "mdns: announce");
        self.zone.write().insert(record.instance_addr(), record);
        self.send(&msg).await
    }

    async fn withdraw(&self, instance_addr: &str) -> Result<()> {
        let removed = self.zone.write().remove(instance_addr);
        match removed {
            Some(record) => {
                debug!(name = %instance_addr, "mdns: goodbye");
                self.send(&response_for(&record, 0, true)?).await
            }
            None => Ok(()),
        }
    }

    async fn query(&self, params: &QueryParams) -> Result<Vec<ServiceEntry>> {
        let wanted = params.service_addr();
        let name = parse_name(&wanted)?;
        let mut rx = self.events.subscribe();

        let mut msg = Message::new();
        msg.set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .add_query(Query::query(name, RecordType::PTR));
        self.send(&msg).await?;

        let mut found: HashMap<String, ServiceEntry> = HashMap::new();
        let deadline = tokio::time::sleep(params.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                msg = rx.recv() => match msg {
                    Ok(entry) => {
                        if entry.name.ends_with(&format!(".{wanted}")) {
                            found.insert(entry.name.clone(), entry);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "mdns: query lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        trace!(service = %wanted, count = found.len(), "mdns: query finished");
        Ok(found.into_values().collect())
    }

    async fn listen(&self, tx: mpsc::Sender<ServiceEntry>, exit: CancellationToken) -> Result<()> {
        let mut rx = self.events.subscribe();
        loop {
            tokio::select! {
                _ = exit.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Ok(entry) => {
                        if tx.send(entry).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "mdns: listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::discovery("mdns socket closed"));
                    }
                },
            }
        }
    }
}

fn bind_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    socket.join_multicast_v4(&MDNS_GROUP_V4, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    zone: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    events: broadcast::Sender<ServiceEntry>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "mdns: receive failed");
                    continue;
                }
            },
        };

        let msg = match Message::from_vec(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(%from, error = %e, "mdns: dropping malformed packet");
                continue;
            }
        };

        match msg.message_type() {
            MessageType::Query => {
                let answers = answer(&msg, &zone.read());
                for reply in answers {
                    match reply.to_vec() {
                        Ok(bytes) => {
                            let dst = SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT);
                            if let Err(e) = socket.send_to(&bytes, dst).await {
                                warn!(error = %e, "mdns: failed to send answer");
                            }
                        }
                        Err(e) => warn!(error = %e, "mdns: failed to encode answer"),
                    }
                }
            }
            MessageType::Response => {
                for entry in entries_from(&msg) {
                    let _ = events.send(entry);
                }
            }
        }
    }
}

/// Build responses for every question the zone can answer.
fn answer(msg: &Message, zone: &HashMap<String, ServiceRecord>) -> Vec<Message> {
    let mut replies = Vec::new();
    for q in msg.queries() {
        if !matches!(
            q.query_type(),
            RecordType::PTR | RecordType::SRV | RecordType::TXT | RecordType::ANY
        ) {
            continue;
        }
        let asked = q.name().to_ascii().to_ascii_lowercase();
        for record in zone.values() {
            let service_hit = record.service_addr().to_ascii_lowercase() == asked;
            let instance_hit = record.instance_addr().to_ascii_lowercase() == asked;
            if !service_hit && !instance_hit {
                continue;
            }
            match response_for(record, record.ttl, service_hit) {
                Ok(reply) => replies.push(reply),
                Err(e) => debug!(error = %e, "mdns: skipping unanswerable record"),
            }
        }
    }
    replies
}

fn parse_name(name: &str) -> Result<Name> {
    Name::from_ascii(name).map_err(|e| Error::discovery(format!("invalid dns name {name:?}: {e}")))
}

/// PTR (optional), SRV, TXT and address records for one instance.
fn response_for(record: &ServiceRecord, ttl: u32, with_ptr: bool) -> Result<Message> {
    record.validate()?;
    let service = parse_name(&record.service_addr())?;
    let instance = parse_name(&record.instance_addr())?;

    let mut msg = Message::new();
    msg.set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true);

    if with_ptr {
        msg.add_answer(Record::from_rdata(
            service,
            ttl,
            RData::PTR(PTR(instance.clone())),
        ));
    }
    msg.add_answer(Record::from_rdata(
        instance.clone(),
        ttl,
        RData::SRV(SRV::new(0, 0, record.port, instance.clone())),
    ));
    msg.add_answer(Record::from_rdata(
        instance.clone(),
        ttl,
        RData::TXT(TXT::new(record.txt.clone())),
    ));
    for ip in &record.ips {
        let rdata = match ip {
            IpAddr::V4(v4) => RData::A(A(*v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
        };
        msg.add_additional(Record::from_rdata(instance.clone(), ttl, rdata));
    }
    Ok(msg)
}

/// Assemble instance entries from the records of one response.
fn entries_from(msg: &Message) -> Vec<ServiceEntry> {
    let mut entries: HashMap<String, ServiceEntry> = HashMap::new();
    let mut v4 = HashMap::new();
    let mut v6 = HashMap::new();

    fn slot<'a>(entries: &'a mut HashMap<String, ServiceEntry>, name: &str) -> &'a mut ServiceEntry {
        entries.entry(name.to_string()).or_insert_with(|| ServiceEntry {
            name: name.to_string(),
            ..Default::default()
        })
    }

    for record in msg.answers().iter().chain(msg.additionals()) {
        let name = record.name().to_ascii();
        let ttl = record.ttl();
        match record.data() {
            Some(RData::PTR(ptr)) => {
                slot(&mut entries, &ptr.0.to_ascii()).ttl = ttl;
            }
            Some(RData::SRV(srv)) => {
                let entry = slot(&mut entries, &name);
                entry.host = srv.target().to_ascii();
                entry.port = srv.port();
                entry.ttl = ttl;
            }
            Some(RData::TXT(txt)) => {
                let entry = slot(&mut entries, &name);
                entry.info_fields = txt
                    .txt_data()
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect();
                entry.ttl = ttl;
            }
            Some(RData::A(a)) => {
                v4.insert(name, a.0);
            }
            Some(RData::AAAA(aaaa)) => {
                v6.insert(name, aaaa.0);
            }
            _ => {}
        }
    }

    entries
        .into_values()
        .filter_map(|mut entry| {
            entry.addr_v4 = v4.get(&entry.host).copied();
            entry.addr_v6 = v6.get(&entry.host).copied();
            // A bare PTR without SRV is incomplete unless it is a goodbye.
            (entry.port != 0 || entry.ttl == 0).then_some(entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::encoding::{self, TxtRecord, TXT_CHUNK_LEN};

    fn record() -> ServiceRecord {
        let txt = encoding::encode(&TxtRecord {
            service: "greeter".into(),
            version: "1.0.0".into(),
            endpoints: Vec::new(),
            metadata: (0..64)
                .map(|i| (format!("key-{i}"), format!("{i:x}-{}", i * 7919)))
                .collect(),
        })
        .unwrap();
        ServiceRecord {
            instance: "node-1".into(),
            service: "greeter".into(),
            domain: "vine".into(),
            port: 9000,
            ips: vec!["10.1.2.3".parse().unwrap(), "fe80::1".parse().unwrap()],
            txt,
            ttl: 120,
        }
    }

    #[test]
    fn response_roundtrips_through_wire_format() {
        let rec = record();
        let msg = response_for(&rec, 120, true).unwrap();
        let bytes = msg.to_vec().unwrap();
        let parsed = Message::from_vec(&bytes).unwrap();

        let entries = entries_from(&parsed);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.name, "node-1.greeter.vine.");
        assert_eq!(entry.port, 9000);
        assert_eq!(entry.ttl, 120);
        assert_eq!(entry.addr_v4, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(entry.addr_v6.is_some());
        assert_eq!(entry.info_fields, rec.txt);
    }

    #[test]
    fn multi_string_txt_decodes_after_wire_trip() {
        let rec = record();
        assert!(rec.txt.len() > 1);
        assert!(rec.txt.iter().all(|s| s.len() <= TXT_CHUNK_LEN));

        let bytes = response_for(&rec, 120, false).unwrap().to_vec().unwrap();
        let entries = entries_from(&Message::from_vec(&bytes).unwrap());
        let txt = encoding::decode(&entries[0].info_fields).unwrap();
        assert_eq!(txt.service, "greeter");
        assert_eq!(txt.metadata.len(), 64);
    }

    #[test]
    fn oversize_txt_is_rejected() {
        let mut rec = record();
        rec.txt.push("a".repeat(TXT_CHUNK_LEN + 1));
        assert!(matches!(
            response_for(&rec, 120, true),
            Err(Error::Discovery(_))
        ));
    }

    #[test]
    fn goodbye_carries_zero_ttl() {
        let msg = response_for(&record(), 0, true).unwrap();
        let entries = entries_from(&msg);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ttl, 0);
    }

    #[test]
    fn answers_service_and_instance_questions() {
        let rec = record();
        let zone = HashMap::from([(rec.instance_addr(), rec)]);

        let mut by_service = Message::new();
        by_service.add_query(Query::query(
            Name::from_ascii("greeter.vine.").unwrap(),
            RecordType::PTR,
        ));
        assert_eq!(answer(&by_service, &zone).len(), 1);

        let mut by_instance = Message::new();
        by_instance.add_query(Query::query(
            Name::from_ascii("node-1.greeter.vine.").unwrap(),
            RecordType::SRV,
        ));
        let replies = answer(&by_instance, &zone);
        assert_eq!(replies.len(), 1);
        assert!(replies[0]
            .answers()
            .iter()
            .all(|r| r.record_type() != RecordType::PTR));

        let mut miss = Message::new();
        miss.add_query(Query::query(
            Name::from_ascii("other.vine.").unwrap(),
            RecordType::PTR,
        ));
        assert!(answer(&miss, &zone).is_empty());
    }
}
