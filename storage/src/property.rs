use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::net::Ipv4Addr;
use std::str::FromStr;

use common::{Error, Handle, NetworkConfig, PropertyFilter};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::{Storage, StorageEngine};

const REGISTRY_TREE: &[u8] = b"PROPERTY_REGISTRY";
const REGISTRY_KEY: &[u8] = b"handles";

/// Reserved property keys `NetworkConfig` is fanned out into (spec §4.4
/// step 4, §6): each field lands under its own name in the handle's
/// ordinary property map rather than behind a separate serialized blob,
/// so `Properties`/`Property` can see them the same as any user-set key.
const KAWASAKI_HOST_INTERFACE: &str = "kawasaki.host-interface";
const KAWASAKI_CONTAINER_INTERFACE: &str = "kawasaki.container-interface";
const KAWASAKI_BRIDGE_INTERFACE: &str = "kawasaki.bridge-interface";
const KAWASAKI_SUBNET: &str = "kawasaki.subnet";
const KAWASAKI_IPTABLE_PREFIX: &str = "kawasaki.iptable-prefix";
const KAWASAKI_IPTABLE_INST: &str = "kawasaki.iptable-inst";
const KAWASAKI_MTU: &str = "kawasaki.mtu";
const KAWASAKI_DNS_SERVERS: &str = "kawasaki.dns-servers";
const GARDEN_NETWORK_CONTAINER_IP: &str = "garden.network.container-ip";
const GARDEN_NETWORK_HOST_IP: &str = "garden.network.host-ip";
const GARDEN_NETWORK_EXTERNAL_IP: &str = "garden.network.external-ip";

type Properties = BTreeMap<String, String>;
type Registry = BTreeMap<String, Entry>;

/// A handle's registry row: its property map, plus whether `register`
/// has actually marked it live. Networker's `Hooks` writes the
/// `kawasaki.*`/`garden.network.*` keys into this same row before
/// `Gardener::Create` calls `register` (prestart hook commands are built
/// from the freshly-allocated `NetworkConfig`), so the row has to exist
/// before the handle counts as live, and `live` tracks that separately
/// from mere row presence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Entry {
    live: bool,
    properties: Properties,
}

/// Per-handle name->value property map, plus the `NetworkConfig` Networker
/// derives in `Hooks`. Both Gardener and Networker hold a reference to the
/// same `PropertyStore` rather than to each other, per the "Property Store
/// is the only shared state across Networker and Gardener" design note.
///
/// Properties are kept in a single registry row rather than one row per
/// key: the `StorageEngine` trait has no range scan, so enumerating "every
/// live handle" or "every property of a handle" needs all of it addressable
/// under one key. Updates go through the same compare-and-swap retry loop
/// used for subnet/address registries.
pub struct PropertyStore<'a, T: StorageEngine> {
    storage: &'a Storage<T>,
}

impl<'a, T: StorageEngine> PropertyStore<'a, T> {
    pub fn new(storage: &'a Storage<T>) -> Self {
        Self { storage }
    }

    /// Registers a handle as live, merging `initial` into whatever
    /// properties (e.g. a `NetworkConfig` `Hooks` already persisted) the
    /// row may already carry. Called once, by Gardener.Create, after
    /// every other subsystem has already succeeded, so `is_live` only
    /// flips true once there is nothing left to roll back.
    #[fehler::throws(Error)]
    pub fn register(&self, handle: &Handle, initial: Properties) {
        self.update_registry(|registry| {
            let entry = registry.entry(handle.as_str().to_owned()).or_default();
            entry.properties.extend(initial.clone());
            entry.live = true;
        })?;
    }

    /// Removes a handle from the registry along with its property map
    /// (network config included, since it lives there too). Idempotent:
    /// deregistering an unknown handle is a no-op, the same tolerance
    /// Destroy extends to every other subsystem.
    #[fehler::throws(Error)]
    pub fn deregister(&self, handle: &Handle) {
        self.update_registry(|registry| {
            registry.remove(handle.as_str());
        })?;
    }

    #[fehler::throws(Error)]
    pub fn is_live(&self, handle: &Handle) -> bool {
        self.registry()?.get(handle.as_str()).map(|entry| entry.live).unwrap_or(false)
    }

    #[fehler::throws(Error)]
    pub fn set(&self, handle: &Handle, name: impl Into<String>, value: impl Into<String>) {
        let (name, value) = (name.into(), value.into());

        self.update_properties(handle, |properties| {
            properties.insert(name.clone(), value.clone());
        })?;
    }

    #[fehler::throws(Error)]
    pub fn get(&self, handle: &Handle, name: &str) -> String {
        self.all(handle)?.remove(name).ok_or_else(|| {
            Error::NotFound(format!(
                "property '{}' not set on '{}'",
                name, handle
            ))
        })?
    }

    #[fehler::throws(Error)]
    pub fn all(&self, handle: &Handle) -> Properties {
        self.registry()?
            .remove(handle.as_str())
            .map(|entry| entry.properties)
            .ok_or_else(|| Error::NotFound(format!("no such container: {}", handle)))?
    }

    #[fehler::throws(Error)]
    pub fn remove(&self, handle: &Handle, name: &str) {
        self.update_properties(handle, |properties| {
            properties.remove(name);
        })?;
    }

    /// `Gardener::Containers` — the live handles whose property map is a
    /// superset of `filter`. Rows that exist but aren't live yet (a
    /// `Hooks` in flight, or left behind by a rolled-back `Create`) are
    /// excluded, the same as `is_live`/`lookup`.
    #[fehler::throws(Error)]
    pub fn containers(&self, filter: &PropertyFilter) -> Vec<Handle> {
        self.registry()?
            .into_iter()
            .filter(|(_, entry)| entry.live)
            .filter(|(_, entry)| {
                filter
                    .iter()
                    .all(|(k, v)| entry.properties.get(k) == Some(v))
            })
            .filter_map(|(handle, _)| Handle::new(handle).ok())
            .collect()
    }

    /// Fans `config` out into the reserved `kawasaki.*`/`garden.network.*`
    /// keys (spec §4.4 step 4, §6) rather than one serialized blob, so the
    /// external property contract is honored by ordinary `Property`/
    /// `Properties` reads.
    #[fehler::throws(Error)]
    pub fn save_network_config(&self, handle: &Handle, config: &NetworkConfig) {
        let dns_servers = config.dns_servers.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");

        self.update_properties(handle, |properties| {
            properties.insert(KAWASAKI_HOST_INTERFACE.to_string(), config.host_intf.clone());
            properties.insert(KAWASAKI_CONTAINER_INTERFACE.to_string(), config.container_intf.clone());
            properties.insert(KAWASAKI_BRIDGE_INTERFACE.to_string(), config.bridge_name.clone());
            properties.insert(KAWASAKI_SUBNET.to_string(), config.subnet.to_string());
            properties.insert(KAWASAKI_IPTABLE_PREFIX.to_string(), config.iptable_prefix.clone());
            properties.insert(KAWASAKI_IPTABLE_INST.to_string(), config.iptable_instance.clone());
            properties.insert(KAWASAKI_MTU.to_string(), config.mtu.to_string());
            properties.insert(KAWASAKI_DNS_SERVERS.to_string(), dns_servers.clone());
            properties.insert(GARDEN_NETWORK_CONTAINER_IP.to_string(), config.container_ip.to_string());
            properties.insert(GARDEN_NETWORK_HOST_IP.to_string(), config.bridge_ip.to_string());
            properties.insert(GARDEN_NETWORK_EXTERNAL_IP.to_string(), config.external_ip.to_string());
        })?;
    }

    /// Reconstructs a `NetworkConfig` from the same reserved keys
    /// `save_network_config` wrote.
    #[fehler::throws(Error)]
    pub fn load_network_config(&self, handle: &Handle) -> NetworkConfig {
        let properties = self.all(handle).map_err(|_| {
            Error::NotFound(format!("no network config for {}", handle))
        })?;

        let missing = || Error::NotFound(format!("no network config for {}", handle));
        let get = |key: &str| -> Result<&String, Error> { properties.get(key).ok_or_else(missing) };

        let dns_servers = get(KAWASAKI_DNS_SERVERS)?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(Ipv4Addr::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| missing())?;

        NetworkConfig {
            host_intf: get(KAWASAKI_HOST_INTERFACE)?.clone(),
            container_intf: get(KAWASAKI_CONTAINER_INTERFACE)?.clone(),
            bridge_name: get(KAWASAKI_BRIDGE_INTERFACE)?.clone(),
            bridge_ip: get(GARDEN_NETWORK_HOST_IP)?.parse().map_err(|_| missing())?,
            container_ip: get(GARDEN_NETWORK_CONTAINER_IP)?.parse().map_err(|_| missing())?,
            subnet: Ipv4Network::try_from(get(KAWASAKI_SUBNET)?.as_str()).map_err(|_| missing())?,
            mtu: get(KAWASAKI_MTU)?.parse().map_err(|_| missing())?,
            external_ip: get(GARDEN_NETWORK_EXTERNAL_IP)?.parse().map_err(|_| missing())?,
            iptable_prefix: get(KAWASAKI_IPTABLE_PREFIX)?.clone(),
            iptable_instance: get(KAWASAKI_IPTABLE_INST)?.clone(),
            dns_servers,
        }
    }

    /// Upserts the row: `Hooks` needs to write `kawasaki.*`/
    /// `garden.network.*` keys before `register` has run, so this can't
    /// require the row to already exist the way `set`/`remove` implicitly
    /// did back when the registry only ever held live handles.
    #[fehler::throws(Error)]
    fn update_properties(
        &self,
        handle: &Handle,
        f: impl Fn(&mut Properties),
    ) {
        self.update_registry(|registry| {
            let entry = registry.entry(handle.as_str().to_owned()).or_default();
            f(&mut entry.properties);
        })?;
    }

    #[fehler::throws(Error)]
    fn registry(&self) -> Registry {
        self.storage
            .get(REGISTRY_TREE, REGISTRY_KEY)
            .map_err(Error::Io)?
            .unwrap_or_default()
    }

    /// Compare-and-swap retry loop: read the whole registry, apply `f`,
    /// attempt the swap, and retry on conflict. Same shape as the
    /// `reserve_addresses`/`release_addresses` helpers it's modeled on.
    #[fehler::throws(Error)]
    fn update_registry(&self, f: impl Fn(&mut Registry)) {
        loop {
            let current = self.storage.get(REGISTRY_TREE, REGISTRY_KEY).map_err(Error::Io)?;
            let mut updated = current.clone().unwrap_or_default();
            f(&mut updated);

            let result = self.storage.compare_and_swap(
                REGISTRY_TREE,
                REGISTRY_KEY,
                current,
                Some(updated),
            );

            match result {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestStorage;

    fn store(dir: &tempfile::TempDir) -> TestStorage {
        TestStorage::new(dir.path()).expect("failed to init storage")
    }

    #[test]
    fn register_then_set_and_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(&dir);
        let properties = PropertyStore::new(&storage);
        let handle = Handle::new("handle-a").unwrap();

        properties.register(&handle, Properties::new()).unwrap();
        properties.set(&handle, "role", "web").unwrap();

        assert_eq!(properties.get(&handle, "role").unwrap(), "web");
    }

    #[test]
    fn get_on_missing_property_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(&dir);
        let properties = PropertyStore::new(&storage);
        let handle = Handle::new("handle-a").unwrap();

        properties.register(&handle, Properties::new()).unwrap();

        assert!(matches!(
            properties.get(&handle, "missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn deregister_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(&dir);
        let properties = PropertyStore::new(&storage);
        let handle = Handle::new("handle-a").unwrap();

        properties.deregister(&handle).unwrap();
        properties.deregister(&handle).unwrap();
    }

    #[test]
    fn network_config_roundtrips_through_reserved_property_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(&dir);
        let properties = PropertyStore::new(&storage);
        let handle = Handle::new("handle-a").unwrap();

        let config = NetworkConfig {
            host_intf: "w-ab-0".into(),
            container_intf: "w-ab-1".into(),
            bridge_name: "w-br-1".into(),
            bridge_ip: "10.254.0.1".parse().unwrap(),
            container_ip: "10.254.0.2".parse().unwrap(),
            subnet: Ipv4Network::try_from("10.254.0.0/30").unwrap(),
            mtu: 1500,
            external_ip: "203.0.113.1".parse().unwrap(),
            iptable_prefix: "w".into(),
            iptable_instance: "1".into(),
            dns_servers: vec!["8.8.8.8".parse().unwrap(), "8.8.4.4".parse().unwrap()],
        };

        properties.register(&handle, Properties::new()).unwrap();
        properties.save_network_config(&handle, &config).unwrap();

        assert_eq!(properties.load_network_config(&handle).unwrap(), config);
        assert_eq!(properties.get(&handle, KAWASAKI_IPTABLE_INST).unwrap(), "1");
        assert_eq!(properties.get(&handle, GARDEN_NETWORK_CONTAINER_IP).unwrap(), "10.254.0.2");
        assert_eq!(properties.get(&handle, KAWASAKI_DNS_SERVERS).unwrap(), "8.8.8.8,8.8.4.4");
    }

    #[test]
    fn network_config_can_be_written_before_register_without_being_live() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(&dir);
        let properties = PropertyStore::new(&storage);
        let handle = Handle::new("handle-a").unwrap();

        let config = NetworkConfig {
            host_intf: "w-ab-0".into(),
            container_intf: "w-ab-1".into(),
            bridge_name: "w-br-1".into(),
            bridge_ip: "10.254.0.1".parse().unwrap(),
            container_ip: "10.254.0.2".parse().unwrap(),
            subnet: Ipv4Network::try_from("10.254.0.0/30").unwrap(),
            mtu: 1500,
            external_ip: "203.0.113.1".parse().unwrap(),
            iptable_prefix: "w".into(),
            iptable_instance: "1".into(),
            dns_servers: vec![],
        };

        // Networker's Hooks writes the network config ahead of Create's
        // own register call.
        properties.save_network_config(&handle, &config).unwrap();
        assert!(!properties.is_live(&handle).unwrap());
        assert!(properties.containers(&PropertyFilter::new()).unwrap().is_empty());

        let mut initial = Properties::new();
        initial.insert("role".into(), "web".into());
        properties.register(&handle, initial).unwrap();

        assert!(properties.is_live(&handle).unwrap());
        assert_eq!(properties.load_network_config(&handle).unwrap(), config);
        assert_eq!(properties.get(&handle, "role").unwrap(), "web");
    }

    #[test]
    fn containers_filters_by_property_and() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(&dir);
        let properties = PropertyStore::new(&storage);

        let mut x1 = Properties::new();
        x1.insert("role".into(), "x".into());
        let mut x2 = Properties::new();
        x2.insert("role".into(), "x".into());
        let mut y = Properties::new();
        y.insert("role".into(), "y".into());

        properties.register(&Handle::new("x1").unwrap(), x1).unwrap();
        properties.register(&Handle::new("x2").unwrap(), x2).unwrap();
        properties.register(&Handle::new("y1").unwrap(), y).unwrap();

        let mut filter = PropertyFilter::new();
        filter.insert("role".into(), "x".into());

        let mut matched: Vec<_> = properties
            .containers(&filter)
            .unwrap()
            .into_iter()
            .map(|h| h.as_str().to_owned())
            .collect();
        matched.sort();

        assert_eq!(matched, vec!["x1".to_string(), "x2".to_string()]);
    }
}
