use concierge_core::domain::record::{Record, TableName};
use concierge_core::errors::ServiceError;
use concierge_core::ports::RecordStore;

/// Deterministic contacts used by local runs and end-to-end checks.
const SEED_CONTACTS: &[SeedContact] = &[
    SeedContact {
        name: "John Carter",
        email: "john.carter@example.com",
        phone: "+971500000101",
        notes: "Quarterly report reviewer",
    },
    SeedContact {
        name: "Amira Haddad",
        email: "amira.haddad@example.com",
        phone: "+971500000102",
        notes: "Prefers mornings",
    },
    SeedContact {
        name: "Sam Lee",
        email: "sam.lee@example.com",
        phone: "+971500000103",
        notes: "",
    },
];

#[derive(Debug, Clone, Copy)]
struct SeedContact {
    name: &'static str,
    email: &'static str,
    phone: &'static str,
    notes: &'static str,
}

impl SeedContact {
    fn record(&self) -> Record {
        let record =
            Record::new(self.name).with_field("email", self.email).with_field("phone", self.phone);
        if self.notes.is_empty() {
            record
        } else {
            record.with_field("notes", self.notes)
        }
    }
}

/// Loads, verifies and removes the seed contacts through any [`RecordStore`].
pub struct ContactSeed;

impl ContactSeed {
    pub fn names() -> Vec<&'static str> {
        SEED_CONTACTS.iter().map(|contact| contact.name).collect()
    }

    /// Creates every seed contact that is not already present.
    pub async fn load(
        store: &dyn RecordStore,
        table: &TableName,
    ) -> Result<SeedResult, ServiceError> {
        let existing = store.list_all(table).await?;
        let mut created = Vec::new();
        let mut skipped = Vec::new();

        for contact in SEED_CONTACTS {
            if existing.iter().any(|record| record.key_matches(contact.name)) {
                skipped.push(contact.name);
                continue;
            }
            store.create(table, contact.record()).await?;
            created.push(contact.name);
        }

        Ok(SeedResult { created, skipped })
    }

    pub async fn verify(
        store: &dyn RecordStore,
        table: &TableName,
    ) -> Result<VerificationResult, ServiceError> {
        let existing = store.list_all(table).await?;
        let checks = SEED_CONTACTS
            .iter()
            .map(|contact| {
                let present = existing.iter().any(|record| {
                    record.key_matches(contact.name) && record.field("email") == Some(contact.email)
                });
                (contact.name, present)
            })
            .collect::<Vec<_>>();
        let all_present = checks.iter().all(|(_, present)| *present);

        Ok(VerificationResult { all_present, checks })
    }

    pub async fn clean(store: &dyn RecordStore, table: &TableName) -> Result<usize, ServiceError> {
        let mut removed = 0;
        for contact in SEED_CONTACTS {
            match store.delete(table, contact.name).await {
                Ok(()) => removed += 1,
                Err(ServiceError::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(removed)
    }
}

#[derive(Debug)]
pub struct SeedResult {
    pub created: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
