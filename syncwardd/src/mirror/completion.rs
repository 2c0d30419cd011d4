use std::collections::{BTreeMap, BTreeSet, HashMap};

use syncward_core::EngineConfig;
use time::OffsetDateTime;

/// Sync progress of one folder as seen by one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FolderCompletion {
    pub percent: f64,
    pub need_bytes: u64,
    pub need_items: u64,
    pub need_deletes: u64,
}

impl FolderCompletion {
    pub fn complete() -> Self {
        Self {
            percent: 100.0,
            need_bytes: 0,
            need_items: 0,
            need_deletes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferRate {
    pub in_bits: u64,
    pub out_bits: u64,
}

#[derive(Debug, Clone, Copy)]
struct Stamped<T> {
    value: T,
    at: OffsetDateTime,
}

/// Per (device, folder) completion and per-device transfer rates.
///
/// Updates arrive from polled connection snapshots, folder status pulls and
/// `FolderCompletion` events. Each slot keeps whichever update carries the
/// newest timestamp, so a late answer from one source never overwrites a
/// fresher value from the other.
#[derive(Debug, Default)]
pub struct CompletionCache {
    shares: BTreeMap<String, BTreeSet<String>>,
    folders: HashMap<(String, String), Stamped<FolderCompletion>>,
    rates: HashMap<String, Stamped<TransferRate>>,
}

impl CompletionCache {
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut cache = Self::default();
        cache.update_identities(config);
        cache
    }

    /// Rebuilds the device/folder sharing sets and drops entries for pairs
    /// that no longer exist.
    pub fn update_identities(&mut self, config: &EngineConfig) {
        let mut shares: BTreeMap<String, BTreeSet<String>> = config
            .devices
            .iter()
            .map(|device| (device.device_id.clone(), BTreeSet::new()))
            .collect();
        for folder in &config.folders {
            for member in &folder.devices {
                if let Some(folders) = shares.get_mut(&member.device_id) {
                    folders.insert(folder.id.clone());
                }
            }
        }
        self.folders.retain(|(device, folder), _| {
            shares
                .get(device)
                .is_some_and(|folders| folders.contains(folder))
        });
        self.rates.retain(|device, _| shares.contains_key(device));
        self.shares = shares;
    }

    pub fn is_tracked(&self, device_id: &str, folder_id: &str) -> bool {
        self.shares
            .get(device_id)
            .is_some_and(|folders| folders.contains(folder_id))
    }

    /// Returns false when a newer update for the pair is already stored.
    pub fn record_folder(
        &mut self,
        device_id: &str,
        folder_id: &str,
        value: FolderCompletion,
        at: OffsetDateTime,
    ) -> bool {
        let key = (device_id.to_string(), folder_id.to_string());
        if let Some(existing) = self.folders.get(&key) {
            if existing.at > at {
                return false;
            }
        }
        self.folders.insert(key, Stamped { value, at });
        true
    }

    pub fn record_rate(
        &mut self,
        device_id: &str,
        value: TransferRate,
        at: OffsetDateTime,
    ) -> bool {
        if let Some(existing) = self.rates.get(device_id) {
            if existing.at > at {
                return false;
            }
        }
        self.rates
            .insert(device_id.to_string(), Stamped { value, at });
        true
    }

    pub fn folder_completion(&self, device_id: &str, folder_id: &str) -> Option<FolderCompletion> {
        self.folders
            .get(&(device_id.to_string(), folder_id.to_string()))
            .map(|stamped| stamped.value)
    }

    pub fn rate(&self, device_id: &str) -> Option<TransferRate> {
        self.rates.get(device_id).map(|stamped| stamped.value)
    }

    /// Average completion over the folders shared with the device, rounded
    /// down. Folders without any report yet count as complete; a device
    /// sharing nothing is complete.
    pub fn device_completion(&self, device_id: &str) -> f64 {
        let Some(folders) = self.shares.get(device_id) else {
            return 100.0;
        };
        if folders.is_empty() {
            return 100.0;
        }
        let sum: f64 = folders
            .iter()
            .map(|folder| {
                self.folder_completion(device_id, folder)
                    .unwrap_or_else(FolderCompletion::complete)
                    .percent
            })
            .sum();
        (sum / folders.len() as f64).floor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncward_core::{Device, Folder, FolderDevice};
    use time::Duration;

    fn config(shares: &[(&str, &[&str])]) -> EngineConfig {
        let mut config = EngineConfig::default();
        let mut folder_members: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (device, folders) in shares {
            config.devices.push(Device {
                device_id: device.to_string(),
                ..Device::default()
            });
            for folder in *folders {
                folder_members.entry(*folder).or_default().push(*device);
            }
        }
        for (folder, members) in folder_members {
            config.folders.push(Folder {
                id: folder.to_string(),
                devices: members
                    .into_iter()
                    .map(|device| FolderDevice {
                        device_id: device.to_string(),
                        ..FolderDevice::default()
                    })
                    .collect(),
                ..Folder::default()
            });
        }
        config
    }

    fn percent(value: f64) -> FolderCompletion {
        FolderCompletion {
            percent: value,
            ..FolderCompletion::complete()
        }
    }

    #[test]
    fn older_update_does_not_overwrite_newer_one() {
        let mut cache = CompletionCache::from_config(&config(&[("phone", &["photos"][..])]));
        let now = OffsetDateTime::now_utc();

        assert!(cache.record_folder("phone", "photos", percent(80.0), now));
        assert!(!cache.record_folder("phone", "photos", percent(10.0), now - Duration::seconds(5)));
        assert_eq!(
            cache.folder_completion("phone", "photos").unwrap().percent,
            80.0
        );
        assert!(cache.record_folder("phone", "photos", percent(90.0), now + Duration::seconds(1)));
        assert_eq!(
            cache.folder_completion("phone", "photos").unwrap().percent,
            90.0
        );
    }

    #[test]
    fn device_completion_averages_shared_folders() {
        let mut cache =
            CompletionCache::from_config(&config(&[("phone", &["photos", "docs", "music"][..])]));
        let now = OffsetDateTime::now_utc();
        cache.record_folder("phone", "photos", percent(50.0), now);
        cache.record_folder("phone", "docs", percent(75.5), now);

        // music has no report yet and counts as complete
        assert_eq!(cache.device_completion("phone"), 75.0);
        assert_eq!(cache.device_completion("unknown"), 100.0);
    }

    #[test]
    fn identity_refresh_prunes_removed_pairs() {
        let mut cache = CompletionCache::from_config(&config(&[
            ("phone", &["photos", "docs"][..]),
            ("nas", &["docs"][..]),
        ]));
        let now = OffsetDateTime::now_utc();
        cache.record_folder("phone", "photos", percent(10.0), now);
        cache.record_folder("nas", "docs", percent(20.0), now);
        cache.record_rate("nas", TransferRate { in_bits: 8, out_bits: 0 }, now);

        cache.update_identities(&config(&[("phone", &["docs"][..])]));

        assert!(cache.folder_completion("phone", "photos").is_none());
        assert!(cache.folder_completion("nas", "docs").is_none());
        assert!(cache.rate("nas").is_none());
        assert!(cache.is_tracked("phone", "docs"));
        assert!(!cache.is_tracked("phone", "photos"));
    }
}
