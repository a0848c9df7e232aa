use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor::{self, COMPACT_CHECK_INTERVAL};
use crate::engine::Engine;
use crate::limits::*;

/// Per-salon engines, keyed by the connection's database name. Each salon
/// gets its own Engine, WAL file and compactor.
pub struct Salons {
    engines: DashMap<String, Arc<Engine>>,
    loaded: AtomicUsize,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl Salons {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            loaded: AtomicUsize::new(0),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for `name`. Two connections racing on a
    /// new salon get the same engine.
    pub fn get_or_open(&self, name: &str) -> io::Result<Arc<Engine>> {
        if name.len() > MAX_SALON_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "salon name too long"));
        }
        let safe_name = sanitize(name)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        match self.engines.entry(safe_name) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                if self.loaded.load(Ordering::Acquire) >= MAX_SALONS {
                    return Err(io::Error::other("too many salons"));
                }
                let wal_path = self.data_dir.join(format!("{}.wal", slot.key()));
                let engine = Arc::new(Engine::new(&wal_path)?);

                tokio::spawn(compactor::run_compactor(
                    Arc::downgrade(&engine),
                    self.compact_threshold,
                    COMPACT_CHECK_INTERVAL,
                ));

                tracing::info!("salon {} opened from {}", slot.key(), wal_path.display());
                slot.insert(engine.clone());
                let loaded = self.loaded.fetch_add(1, Ordering::AcqRel) + 1;
                metrics::gauge!(crate::observability::SALONS_ACTIVE).set(loaded as f64);
                Ok(engine)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keep only characters that are safe in a file name.
fn sanitize(name: &str) -> io::Result<String> {
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty salon name"));
    }
    Ok(safe)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use ulid::Ulid;

    use super::*;
    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("salond_test_salon").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn haircut(id: Ulid) -> Service {
        Service {
            id,
            name: "Haircut".into(),
            duration: 45,
            price: 4500,
            active: true,
        }
    }

    #[tokio::test]
    async fn salon_isolation() {
        let salons = Salons::new(test_data_dir("isolation"), 1000);
        let admin = Principal::new(Role::Admin, Ulid::new());

        let north = salons.get_or_open("north").unwrap();
        let south = salons.get_or_open("south").unwrap();

        let id = Ulid::new();
        north.register_service(&admin, haircut(id)).await.unwrap();

        assert!(north.service(id).is_ok());
        assert!(south.service(id).is_err());
        assert!(south.list_services().is_empty());
    }

    #[tokio::test]
    async fn salon_lazy_creation() {
        let dir = test_data_dir("lazy");
        let salons = Salons::new(dir.clone(), 1000);
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        assert!(salons.is_empty());

        let _engine = salons.get_or_open("downtown").unwrap();
        assert!(dir.join("downtown.wal").exists());
        assert_eq!(salons.len(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let salons = Salons::new(test_data_dir("same"), 1000);
        let a = salons.get_or_open("foo").unwrap();
        let b = salons.get_or_open("foo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(salons.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn racing_opens_share_one_engine() {
        let salons = Arc::new(Salons::new(test_data_dir("race"), 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let salons = salons.clone();
                tokio::spawn(async move { salons.get_or_open("busy").unwrap() })
            })
            .collect();
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(salons.len(), 1);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = test_data_dir("reopen");
        let admin = Principal::new(Role::Admin, Ulid::new());
        let id = Ulid::new();
        {
            let salons = Salons::new(dir.clone(), 1000);
            let engine = salons.get_or_open("main").unwrap();
            engine.register_service(&admin, haircut(id)).await.unwrap();
        }
        let salons = Salons::new(dir, 1000);
        let engine = salons.get_or_open("main").unwrap();
        assert_eq!(engine.service(id).unwrap().duration, 45);
    }

    #[tokio::test]
    async fn salon_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let salons = Salons::new(dir.clone(), 1000);

        let evil = salons.get_or_open("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        let plain = salons.get_or_open("evil").unwrap();
        assert!(Arc::ptr_eq(&evil, &plain));

        assert!(salons.get_or_open("../..").is_err());
    }

    #[tokio::test]
    async fn salon_name_too_long() {
        let salons = Salons::new(test_data_dir("name_too_long"), 1000);
        let err = salons.get_or_open(&"x".repeat(MAX_SALON_NAME_LEN + 1)).err().unwrap();
        assert!(err.to_string().contains("salon name too long"));
        assert!(salons.get_or_open(&"x".repeat(MAX_SALON_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn salon_count_limit() {
        let salons = Salons::new(test_data_dir("count_limit"), 1000);
        for i in 0..MAX_SALONS {
            salons.get_or_open(&format!("s{i}")).unwrap();
        }
        let err = salons.get_or_open("one_more").err().unwrap();
        assert!(err.to_string().contains("too many salons"));
        assert!(salons.get_or_open("s0").is_ok());
    }
}
