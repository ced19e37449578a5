//! Per-peer connection registry

use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionHandle, DataState, MediaState, Owner};
use crate::session::Event;

/// Connections grouped by remote peer, both in registration order
#[derive(Default)]
pub(crate) struct Registry {
    peers: Vec<(String, Vec<Connection>)>,
}

impl Registry {
    pub fn insert(&mut self, connection: Connection) {
        let peer = connection.core().info.peer.clone();
        match self.peers.iter_mut().find(|(p, _)| *p == peer) {
            Some((_, list)) => list.push(connection),
            None => self.peers.push((peer, vec![connection])),
        }
    }

    pub fn get(&self, owner: &Owner) -> Option<&Connection> {
        self.peers
            .iter()
            .find(|(p, _)| *p == owner.peer)
            .and_then(|(_, list)| list.iter().find(|c| c.id() == owner.connection_id))
    }

    pub fn get_mut(&mut self, owner: &Owner) -> Option<&mut Connection> {
        self.peers
            .iter_mut()
            .find(|(p, _)| *p == owner.peer)
            .and_then(|(_, list)| list.iter_mut().find(|c| c.id() == owner.connection_id))
    }

    pub fn data_mut(&mut self, owner: &Owner) -> Option<&mut DataState> {
        match self.get_mut(owner) {
            Some(Connection::Data(d)) => Some(d),
            _ => None,
        }
    }

    pub fn media_mut(&mut self, owner: &Owner) -> Option<&mut MediaState> {
        match self.get_mut(owner) {
            Some(Connection::Media(m)) => Some(m),
            _ => None,
        }
    }

    pub fn remove(&mut self, owner: &Owner) -> Option<Connection> {
        let index = self.peers.iter().position(|(p, _)| *p == owner.peer)?;
        let list = &mut self.peers[index].1;
        let position = list.iter().position(|c| c.id() == owner.connection_id)?;
        let connection = list.remove(position);
        if list.is_empty() {
            self.peers.remove(index);
        }
        Some(connection)
    }

    /// Every connection to `peer`
    pub fn owners_for(&self, peer: &str) -> Vec<Owner> {
        self.peers
            .iter()
            .filter(|(p, _)| p == peer)
            .flat_map(|(_, list)| list.iter().map(|c| c.core().info.owner()))
            .collect()
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.iter().map(|(_, list)| list.len()).sum()
    }

    pub fn snapshot(&self, tx: &mpsc::UnboundedSender<Event>) -> Vec<(String, Vec<ConnectionHandle>)> {
        self.peers
            .iter()
            .map(|(peer, list)| (peer.clone(), list.iter().map(|c| c.handle(tx)).collect()))
            .collect()
    }
}
