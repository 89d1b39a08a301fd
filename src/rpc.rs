// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The peer contract a remote replica exposes to `synch` (§2.7), plus an in-process
//! implementation and a minimal length-prefixed TCP transport for two real processes.

use crate::digest::Hash;
use crate::engine::HashTree;
use crate::keys::TreeId;
use crate::manager::StopSignal;
use crate::store::{DigestStore, SegmentEntry};
use crate::tree_math::NodeId;
use crate::user_store::UserStore;
use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// The read/write surface a remote hash-tree replica must expose to participate in
/// `synch` (§4.5). Mirrors the subset of [`HashTree`]'s API the walker actually calls.
pub trait Peer: Send + Sync {
    /// See [`HashTree::get_segment_hash`].
    fn get_segment_hash(&self, tree_id: TreeId, node_id: NodeId) -> Result<Option<Hash>>;

    /// See [`HashTree::get_segment_hashes`].
    fn get_segment_hashes(&self, tree_id: TreeId, node_ids: &[NodeId]) -> Result<Vec<(NodeId, Hash)>>;

    /// See [`HashTree::get_segment`].
    fn get_segment(&self, tree_id: TreeId, seg_id: u32) -> Result<Vec<SegmentEntry>>;

    /// See [`HashTree::s_put`].
    fn s_put(&self, tree_id: TreeId, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()>;

    /// See [`HashTree::s_remove`].
    fn s_remove(&self, tree_id: TreeId, keys: &[Vec<u8>]) -> Result<()>;

    /// See [`HashTree::delete_tree_node`].
    fn delete_tree_node(&self, tree_id: TreeId, node_id: NodeId) -> Result<()>;
}

/// An in-process [`Peer`] wrapping a local [`HashTree`] directly, with no
/// serialization. Used for single-process tests and for embedding two trees in the
/// same program.
pub struct LocalPeer<D, U> {
    tree: Arc<HashTree<D, U>>,
}

impl<D, U> LocalPeer<D, U> {
    /// Wraps `tree` as a [`Peer`].
    #[must_use]
    pub fn new(tree: Arc<HashTree<D, U>>) -> Self {
        Self { tree }
    }
}

impl<D, U> Peer for LocalPeer<D, U>
where
    D: DigestStore,
    U: UserStore,
{
    fn get_segment_hash(&self, tree_id: TreeId, node_id: NodeId) -> Result<Option<Hash>> {
        self.tree.get_segment_hash(tree_id, node_id)
    }

    fn get_segment_hashes(&self, tree_id: TreeId, node_ids: &[NodeId]) -> Result<Vec<(NodeId, Hash)>> {
        self.tree.get_segment_hashes(tree_id, node_ids)
    }

    fn get_segment(&self, tree_id: TreeId, seg_id: u32) -> Result<Vec<SegmentEntry>> {
        self.tree.get_segment(tree_id, seg_id)
    }

    fn s_put(&self, tree_id: TreeId, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        self.tree.s_put(tree_id, entries)
    }

    fn s_remove(&self, tree_id: TreeId, keys: &[Vec<u8>]) -> Result<()> {
        self.tree.s_remove(tree_id, keys)
    }

    fn delete_tree_node(&self, tree_id: TreeId, node_id: NodeId) -> Result<()> {
        self.tree.delete_tree_node(tree_id, node_id)
    }
}

// --- Minimal length-prefixed TCP transport -------------------------------------------
//
// Wire format: every request/response frame is `u32 BE length` followed by that many
// bytes of a hand-rolled tag+fields encoding (Open Question resolution, §9: no
// `serde`/`bincode` dependency is pulled in purely for this, matching the teacher
// crate's own preference for direct byte encoding over a serialization framework for
// its on-disk formats).

const OP_GET_HASH: u8 = 1;
const OP_GET_HASHES: u8 = 2;
const OP_GET_SEGMENT: u8 = 3;
const OP_S_PUT: u8 = 4;
const OP_S_REMOVE: u8 = 5;
const OP_DELETE_NODE: u8 = 6;

fn write_frame(stream: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    stream.write_u32::<BigEndian>(bytes.len() as u32)?;
    stream.write_all(bytes)
}

fn read_frame(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32::<BigEndian>()?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_bytes_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    buf.write_u32::<BigEndian>(bytes.len() as u32).expect("vec write cannot fail");
    buf.extend_from_slice(bytes);
}

fn read_bytes_field(cursor: &mut &[u8]) -> std::io::Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()?;
    let mut buf = vec![0u8; len as usize];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// A TCP client implementing [`Peer`] by framing each call as a request/response
/// round-trip against a [`TcpPeerServer`]. One connection is opened per call; the
/// transport favors simplicity over connection reuse, matching the scope of this
/// crate's networking (a sync pass is infrequent relative to a single TCP handshake's
/// cost).
pub struct TcpPeerClient<A> {
    addr: A,
}

impl<A: ToSocketAddrs + Clone> TcpPeerClient<A> {
    /// Creates a client dialing `addr` for every call.
    #[must_use]
    pub fn new(addr: A) -> Self {
        Self { addr }
    }

    fn roundtrip(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream =
            TcpStream::connect(self.addr.clone()).map_err(|e| Error::Remote(format!("connect failed: {e}")))?;
        write_frame(&mut stream, request).map_err(|e| Error::Remote(format!("write failed: {e}")))?;
        read_frame(&mut stream).map_err(|e| Error::Remote(format!("read failed: {e}")))
    }
}

impl<A: ToSocketAddrs + Clone + Send + Sync> Peer for TcpPeerClient<A> {
    fn get_segment_hash(&self, tree_id: TreeId, node_id: NodeId) -> Result<Option<Hash>> {
        let mut req = vec![OP_GET_HASH];
        req.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
        req.write_u32::<BigEndian>(node_id).expect("vec write cannot fail");

        let resp = self.roundtrip(&req)?;
        match resp.first() {
            Some(0) => Ok(None),
            Some(1) if resp.len() == 21 => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&resp[1..21]);
                Ok(Some(hash))
            }
            _ => Err(Error::Remote("malformed get_segment_hash response".into())),
        }
    }

    fn get_segment_hashes(&self, tree_id: TreeId, node_ids: &[NodeId]) -> Result<Vec<(NodeId, Hash)>> {
        let mut req = vec![OP_GET_HASHES];
        req.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
        #[allow(clippy::cast_possible_truncation)]
        req.write_u32::<BigEndian>(node_ids.len() as u32).expect("vec write cannot fail");
        for &id in node_ids {
            req.write_u32::<BigEndian>(id).expect("vec write cannot fail");
        }

        let resp = self.roundtrip(&req)?;
        let mut cursor = resp.as_slice();
        let count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Remote(format!("malformed response: {e}")))?;

        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let node_id = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Remote(format!("malformed response: {e}")))?;
            let mut hash = [0u8; 20];
            cursor
                .read_exact(&mut hash)
                .map_err(|e| Error::Remote(format!("malformed response: {e}")))?;
            out.push((node_id, hash));
        }
        Ok(out)
    }

    fn get_segment(&self, tree_id: TreeId, seg_id: u32) -> Result<Vec<SegmentEntry>> {
        let mut req = vec![OP_GET_SEGMENT];
        req.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
        req.write_u32::<BigEndian>(seg_id).expect("vec write cannot fail");

        let resp = self.roundtrip(&req)?;
        let mut cursor = resp.as_slice();
        let count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Remote(format!("malformed response: {e}")))?;

        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_bytes_field(&mut cursor).map_err(|e| Error::Remote(format!("malformed response: {e}")))?;
            let mut hash = [0u8; 20];
            cursor
                .read_exact(&mut hash)
                .map_err(|e| Error::Remote(format!("malformed response: {e}")))?;
            out.push((key, hash));
        }
        Ok(out)
    }

    fn s_put(&self, tree_id: TreeId, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut req = vec![OP_S_PUT];
        req.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
        #[allow(clippy::cast_possible_truncation)]
        req.write_u32::<BigEndian>(entries.len() as u32).expect("vec write cannot fail");
        for (k, v) in entries {
            write_bytes_field(&mut req, k);
            write_bytes_field(&mut req, v);
        }
        self.roundtrip(&req)?;
        Ok(())
    }

    fn s_remove(&self, tree_id: TreeId, keys: &[Vec<u8>]) -> Result<()> {
        let mut req = vec![OP_S_REMOVE];
        req.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
        #[allow(clippy::cast_possible_truncation)]
        req.write_u32::<BigEndian>(keys.len() as u32).expect("vec write cannot fail");
        for k in keys {
            write_bytes_field(&mut req, k);
        }
        self.roundtrip(&req)?;
        Ok(())
    }

    fn delete_tree_node(&self, tree_id: TreeId, node_id: NodeId) -> Result<()> {
        let mut req = vec![OP_DELETE_NODE];
        req.write_u64::<BigEndian>(tree_id).expect("vec write cannot fail");
        req.write_u32::<BigEndian>(node_id).expect("vec write cannot fail");
        self.roundtrip(&req)?;
        Ok(())
    }
}

/// A TCP server dispatching framed requests to a local `dyn Peer`, one connection
/// handled (sequentially, request-by-request) per accepted socket.
pub struct TcpPeerServer {
    listener: TcpListener,
    peer: Arc<dyn Peer>,
}

impl TcpPeerServer {
    /// Binds `addr` and wraps `peer` to serve requests against it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub fn bind(addr: impl ToSocketAddrs, peer: Arc<dyn Peer>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, peer })
    }

    /// The address actually bound, useful when binding to port 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the listener's local address cannot be read.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and serves connections until `stop` fires, blocking the calling thread.
    /// Intended to be run on its own dedicated thread, stopped cooperatively the same
    /// way [`crate::HashTreeManager`]'s schedules are: `stop.stop()` from another
    /// thread, then join the serving thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if switching the listener to non-blocking mode fails or
    /// `accept` itself reports an error other than `WouldBlock`; per-connection I/O
    /// errors are logged and that connection is dropped.
    pub fn serve(&self, stop: &StopSignal) -> Result<()> {
        self.listener.set_nonblocking(true)?;

        while !stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    if let Err(e) = Self::handle_connection(stream, &self.peer) {
                        log::warn!("hash-tree: rpc connection error: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn handle_connection(stream: TcpStream, peer: &Arc<dyn Peer>) -> Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        let request = read_frame(&mut reader)?;
        let response = Self::dispatch(peer, &request)?;
        write_frame(&mut writer, &response)?;
        writer.flush()?;
        Ok(())
    }

    fn dispatch(peer: &Arc<dyn Peer>, request: &[u8]) -> Result<Vec<u8>> {
        let Some((&op, mut body)) = request.split_first() else {
            return Err(Error::Remote("empty request frame".into()));
        };

        match op {
            OP_GET_HASH => {
                let tree_id = body.read_u64::<BigEndian>()?;
                let node_id = body.read_u32::<BigEndian>()?;
                let mut resp = Vec::new();
                match peer.get_segment_hash(tree_id, node_id)? {
                    Some(hash) => {
                        resp.push(1);
                        resp.extend_from_slice(&hash);
                    }
                    None => resp.push(0),
                }
                Ok(resp)
            }
            OP_GET_HASHES => {
                let tree_id = body.read_u64::<BigEndian>()?;
                let count = body.read_u32::<BigEndian>()?;
                let mut node_ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    node_ids.push(body.read_u32::<BigEndian>()?);
                }

                let hashes = peer.get_segment_hashes(tree_id, &node_ids)?;
                let mut resp = Vec::new();
                #[allow(clippy::cast_possible_truncation)]
                resp.write_u32::<BigEndian>(hashes.len() as u32)?;
                for (node_id, hash) in hashes {
                    resp.write_u32::<BigEndian>(node_id)?;
                    resp.extend_from_slice(&hash);
                }
                Ok(resp)
            }
            OP_GET_SEGMENT => {
                let tree_id = body.read_u64::<BigEndian>()?;
                let seg_id = body.read_u32::<BigEndian>()?;

                let entries = peer.get_segment(tree_id, seg_id)?;
                let mut resp = Vec::new();
                #[allow(clippy::cast_possible_truncation)]
                resp.write_u32::<BigEndian>(entries.len() as u32)?;
                for (key, hash) in entries {
                    write_bytes_field(&mut resp, &key);
                    resp.extend_from_slice(&hash);
                }
                Ok(resp)
            }
            OP_S_PUT => {
                let tree_id = body.read_u64::<BigEndian>()?;
                let count = body.read_u32::<BigEndian>()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = read_bytes_field(&mut body)?;
                    let value = read_bytes_field(&mut body)?;
                    entries.push((key, value));
                }
                peer.s_put(tree_id, &entries)?;
                Ok(Vec::new())
            }
            OP_S_REMOVE => {
                let tree_id = body.read_u64::<BigEndian>()?;
                let count = body.read_u32::<BigEndian>()?;
                let mut keys = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    keys.push(read_bytes_field(&mut body)?);
                }
                peer.s_remove(tree_id, &keys)?;
                Ok(Vec::new())
            }
            OP_DELETE_NODE => {
                let tree_id = body.read_u64::<BigEndian>()?;
                let node_id = body.read_u32::<BigEndian>()?;
                peer.delete_tree_node(tree_id, node_id)?;
                Ok(Vec::new())
            }
            _ => Err(Error::Remote(format!("unknown rpc opcode {op}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashTreeConfig;
    use crate::providers::FixedTreeId;
    use crate::store::MemoryDigestStore;
    use crate::user_store::MemoryUserStore;
    use std::thread;

    fn local_tree() -> Arc<HashTree<MemoryDigestStore, MemoryUserStore>> {
        let config = HashTreeConfig::new()
            .enable_non_blocking_calls(false)
            .tree_id_provider(Arc::new(FixedTreeId(1)))
            .build()
            .unwrap();

        HashTree::new(config, MemoryDigestStore::new(), MemoryUserStore::single_tree(1))
    }

    #[test]
    fn local_peer_roundtrips_through_the_trait() {
        let tree = local_tree();
        tree.h_put(b"k", b"v").unwrap();

        let peer = LocalPeer::new(Arc::clone(&tree));
        assert_eq!(tree.get_segment(1, 0).unwrap(), Peer::get_segment(&peer, 1, 0).unwrap());
    }

    #[test]
    fn tcp_transport_serves_get_segment_and_s_put() {
        let tree = local_tree();
        tree.h_put(b"k", b"v").unwrap();
        tree.rebuild(1, crate::config::FullRebuildMode::Always).unwrap();

        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(Arc::clone(&tree)));
        let server = TcpPeerServer::bind("127.0.0.1:0", peer).unwrap();
        let addr = server.local_addr().unwrap();

        let stop = StopSignal::new();
        let server_stop = stop.clone();
        let handle = thread::spawn(move || {
            let _ = server.serve(&server_stop);
        });

        let client = TcpPeerClient::new(addr);
        let segment = client.get_segment(1, 0).unwrap();
        assert_eq!(1, segment.len());

        client.s_put(1, &[(b"remote-key".to_vec(), b"remote-value".to_vec())]).unwrap();
        assert_eq!(Some(b"remote-value".to_vec()), tree.user_store().get(b"remote-key").unwrap());

        stop.stop();
        handle.join().unwrap();
    }
}
