//! Device and signal state for one paired instance, in its own sled tree.

use std::path::Path;

use {
    async_trait::async_trait,
    serde::{Serialize, de::DeserializeOwned},
    wacore::{
        appstate::{hash::HashState, processor::AppStateMutationMAC},
        store::{
            Device,
            error::{Result, StoreError},
            traits::{
                AppStateSyncKey, AppSyncStore, DeviceListRecord, DeviceStore, LidPnMappingEntry,
                ProtocolStore, SignalStore,
            },
        },
    },
};

pub struct SledDeviceStore {
    db: sled::Db,
}

fn db_err(e: sled::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn codec_err(e: postcard::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl SledDeviceStore {
    pub fn open(dir: &Path) -> std::result::Result<Self, sled::Error> {
        Ok(Self {
            db: sled::open(dir)?,
        })
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key).map_err(db_err)?.map(|v| v.to_vec()))
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key, value).map_err(db_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key).map_err(db_err)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_raw(key)?
            .map(|raw| postcard::from_bytes(&raw).map_err(codec_err))
            .transpose()
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = postcard::to_allocvec(value).map_err(codec_err)?;
        self.put_raw(key, &raw)
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        self.db
            .scan_prefix(prefix)
            .map(|entry| {
                let (k, v) = entry.map_err(db_err)?;
                let key = String::from_utf8_lossy(&k[prefix.len()..]).into_owned();
                Ok((key, postcard::from_bytes(&v).map_err(codec_err)?))
            })
            .collect()
    }
}

#[async_trait]
impl SignalStore for SledDeviceStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        self.put_raw(&format!("identity/{address}"), &key)
    }

    async fn load_identity(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw(&format!("identity/{address}"))
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.remove(&format!("identity/{address}"))
    }

    async fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw(&format!("session/{address}"))
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        self.put_raw(&format!("session/{address}"), session)
    }

    async fn delete_session(&self, address: &str) -> Result<()> {
        self.remove(&format!("session/{address}"))
    }

    async fn store_prekey(&self, id: u32, record: &[u8], _uploaded: bool) -> Result<()> {
        self.put_raw(&format!("prekey/{id}"), record)
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get_raw(&format!("prekey/{id}"))
    }

    async fn remove_prekey(&self, id: u32) -> Result<()> {
        self.remove(&format!("prekey/{id}"))
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> Result<()> {
        self.put_raw(&format!("signed/{id}"), record)
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get_raw(&format!("signed/{id}"))
    }

    async fn load_all_signed_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix("signed/") {
            let (k, v) = entry.map_err(db_err)?;
            if let Some(id) = std::str::from_utf8(&k["signed/".len()..])
                .ok()
                .and_then(|s| s.parse().ok())
            {
                out.push((id, v.to_vec()));
            }
        }
        Ok(out)
    }

    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        self.remove(&format!("signed/{id}"))
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> Result<()> {
        self.put_raw(&format!("sender/{address}"), record)
    }

    async fn get_sender_key(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get_raw(&format!("sender/{address}"))
    }

    async fn delete_sender_key(&self, address: &str) -> Result<()> {
        self.remove(&format!("sender/{address}"))
    }
}

#[async_trait]
impl AppSyncStore for SledDeviceStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<AppStateSyncKey>> {
        Ok(self
            .get::<(Vec<u8>, Vec<u8>, i64)>(&format!("synckey/{}", hex(key_id)))?
            .map(|(key_data, fingerprint, timestamp)| AppStateSyncKey {
                key_data,
                fingerprint,
                timestamp,
            }))
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> Result<()> {
        self.put(
            &format!("synckey/{}", hex(key_id)),
            &(key.key_data, key.fingerprint, key.timestamp),
        )
    }

    async fn get_version(&self, name: &str) -> Result<HashState> {
        Ok(self.get(&format!("version/{name}"))?.unwrap_or_default())
    }

    async fn set_version(&self, name: &str, state: HashState) -> Result<()> {
        self.put(&format!("version/{name}"), &state)
    }

    async fn put_mutation_macs(
        &self,
        name: &str,
        _version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> Result<()> {
        for m in mutations {
            self.put_raw(&format!("mac/{name}/{}", hex(&m.index_mac)), &m.value_mac)?;
        }
        Ok(())
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_raw(&format!("mac/{name}/{}", hex(index_mac)))
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()> {
        for index_mac in index_macs {
            self.remove(&format!("mac/{name}/{}", hex(index_mac)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolStore for SledDeviceStore {
    async fn get_skdm_recipients(&self, group_jid: &str) -> Result<Vec<String>> {
        Ok(self.get(&format!("skdm/{group_jid}"))?.unwrap_or_default())
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[String]) -> Result<()> {
        let key = format!("skdm/{group_jid}");
        let mut recipients: Vec<String> = self.get(&key)?.unwrap_or_default();
        for jid in device_jids {
            if !recipients.contains(jid) {
                recipients.push(jid.clone());
            }
        }
        self.put(&key, &recipients)
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> Result<()> {
        self.remove(&format!("skdm/{group_jid}"))
    }

    async fn get_lid_mapping(&self, lid: &str) -> Result<Option<LidPnMappingEntry>> {
        self.get(&format!("lid/{lid}"))
    }

    async fn get_pn_mapping(&self, phone: &str) -> Result<Option<LidPnMappingEntry>> {
        match self.get_raw(&format!("pn/{phone}"))? {
            Some(lid) => self.get(&format!("lid/{}", String::from_utf8_lossy(&lid))),
            None => Ok(None),
        }
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> Result<()> {
        self.put(&format!("lid/{}", entry.lid), entry)?;
        self.put_raw(&format!("pn/{}", entry.phone_number), entry.lid.as_bytes())
    }

    async fn get_all_lid_mappings(&self) -> Result<Vec<LidPnMappingEntry>> {
        Ok(self
            .scan::<LidPnMappingEntry>("lid/")?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    async fn save_base_key(&self, address: &str, message_id: &str, base_key: &[u8]) -> Result<()> {
        self.put_raw(&format!("basekey/{address}/{message_id}"), base_key)
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> Result<bool> {
        Ok(self
            .get_raw(&format!("basekey/{address}/{message_id}"))?
            .is_some_and(|stored| stored == current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> Result<()> {
        self.remove(&format!("basekey/{address}/{message_id}"))
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> Result<()> {
        self.put(&format!("devices/{}", record.user), &record)
    }

    async fn get_devices(&self, user: &str) -> Result<Option<DeviceListRecord>> {
        self.get(&format!("devices/{user}"))
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> Result<()> {
        self.put_raw(&format!("forget/{group_jid}/{participant}"), &[])
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> Result<Vec<String>> {
        let prefix = format!("forget/{group_jid}/");
        let mut marked = Vec::new();
        for entry in self.db.scan_prefix(&prefix) {
            let (k, _) = entry.map_err(db_err)?;
            marked.push(String::from_utf8_lossy(&k[prefix.len()..]).into_owned());
            self.db.remove(k).map_err(db_err)?;
        }
        Ok(marked)
    }
}

#[async_trait]
impl DeviceStore for SledDeviceStore {
    async fn save(&self, device: &Device) -> Result<()> {
        self.put("device", device)?;
        self.db.flush_async().await.map_err(db_err)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Device>> {
        self.get("device")
    }

    async fn exists(&self) -> Result<bool> {
        self.db.contains_key("device").map_err(db_err)
    }

    async fn create(&self) -> Result<i32> {
        Ok(1)
    }
}
