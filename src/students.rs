//! Student roster accessor.
//!
//! The representative resource accessor: every resource family (classes,
//! students, grades, diary, essay themes) wraps its remote API the same way
//! — local validation first, optimistic splice into the in-memory
//! collection, authoritative replacement on success, exact restore on
//! failure, and resource-group cache invalidation after committed
//! mutations. Only one mutation per entity may be in flight at a time.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::CacheEngine;
use crate::error::{FetchError, MutationError, ValidationError};
use crate::mutation::with_optimistic_update;
use crate::result::Result;

/// A student as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    /// Server-assigned identifier; provisional entries carry a `tmp-` id
    /// until the server confirms them.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Contact e-mail.
    pub email: String,
}

impl Student {
    /// `true` while this entry is an optimistic guess awaiting the server.
    pub fn is_provisional(&self) -> bool {
        self.id.starts_with("tmp-")
    }
}

/// Payload for creating or updating a student.
#[derive(Debug, Clone)]
pub struct StudentPayload {
    /// Display name; required.
    pub name: String,
    /// Contact e-mail; required, must look like an address.
    pub email: String,
}

/// List parameters; also the source of the cache key, so each filter
/// combination caches independently.
#[derive(Debug, Clone)]
pub struct StudentListParams {
    /// Class whose roster is listed.
    pub class_id: String,
    /// Optional name/e-mail search term.
    pub search: Option<String>,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub page_size: u32,
}

impl StudentListParams {
    /// Default listing for a class: first page, no search.
    pub fn for_class(class_id: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            search: None,
            page: 1,
            page_size: 10,
        }
    }

    /// Cache key for this filter combination.
    pub fn cache_key(&self) -> String {
        let mut key = format!(
            "students:{}:p{}:s{}",
            self.class_id, self.page, self.page_size
        );
        if let Some(search) = &self.search {
            key.push_str(":q=");
            key.push_str(search);
        }
        key
    }
}

/// Validate a create/update payload. Field-level failures never reach the
/// network and never touch the local collection.
pub fn validate_student(payload: &StudentPayload) -> Result<(), ValidationError> {
    let mut err = ValidationError {
        subject: "student".to_string(),
        fields: Default::default(),
    };
    if payload.name.trim().is_empty() {
        err.fields
            .insert("name".to_string(), "name is required".to_string());
    }
    if payload.email.trim().is_empty() {
        err.fields
            .insert("email".to_string(), "email is required".to_string());
    } else if !payload.email.contains('@') || payload.email.ends_with('@') {
        err.fields
            .insert("email".to_string(), "email is not a valid address".to_string());
    }
    if err.fields.is_empty() { Ok(()) } else { Err(err) }
}

/// Validate an invite e-mail.
pub fn validate_invite(email: &str) -> Result<(), ValidationError> {
    if email.trim().is_empty() {
        return Err(ValidationError::field("invite", "email", "email is required"));
    }
    if !email.contains('@') || email.ends_with('@') {
        return Err(ValidationError::field(
            "invite",
            "email",
            "email is not a valid address",
        ));
    }
    Ok(())
}

/// Remote student API, consumed as opaque async operations. The layer knows
/// nothing about HTTP, only success/failure and the returned payload.
#[async_trait]
pub trait StudentApi: Send + Sync {
    /// List students matching `params`.
    async fn list(&self, params: &StudentListParams) -> Result<Vec<Student>, FetchError>;
    /// Create a student in `class_id`; returns the authoritative record.
    async fn create(&self, class_id: &str, payload: &StudentPayload)
    -> Result<Student, MutationError>;
    /// Update a student; returns the authoritative record.
    async fn update(
        &self,
        class_id: &str,
        id: &str,
        payload: &StudentPayload,
    ) -> Result<Student, MutationError>;
    /// Remove a student.
    async fn delete(&self, class_id: &str, id: &str) -> Result<(), MutationError>;
    /// Invite a student by e-mail; returns the invite URL.
    async fn invite(&self, class_id: &str, email: &str) -> Result<String, MutationError>;
}

/// In-memory roster for one class, kept consistent with the remote API
/// through the optimistic mutation protocol.
pub struct StudentRoster {
    class_id: String,
    api: Arc<dyn StudentApi>,
    cache: Arc<CacheEngine<Vec<Student>>>,
    students: Mutex<Vec<Student>>,
    in_flight: Mutex<HashSet<String>>,
}

impl StudentRoster {
    /// Create a roster for `class_id` backed by `api`, invalidating group
    /// entries in `cache` after committed mutations.
    pub fn new(
        class_id: impl Into<String>,
        api: Arc<dyn StudentApi>,
        cache: Arc<CacheEngine<Vec<Student>>>,
    ) -> Self {
        Self {
            class_id: class_id.into(),
            api,
            cache,
            students: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Snapshot of the current collection, provisional entries included.
    pub fn students(&self) -> Vec<Student> {
        self.students.lock().clone()
    }

    /// Fetch the roster from the remote API and write it through the cache.
    pub async fn load(&self, params: &StudentListParams) -> Result<Vec<Student>, FetchError> {
        let students = self.api.list(params).await?;
        *self.students.lock() = students.clone();
        self.cache
            .set_with_default_ttl(&params.cache_key(), students.clone());
        debug!(class_id = %self.class_id, count = students.len(), "roster loaded");
        Ok(students)
    }

    /// Create a student optimistically.
    ///
    /// A provisional entry with a `tmp-` identifier is spliced in at the
    /// front immediately; the server's record replaces it on success, and
    /// the splice is undone exactly on failure.
    pub async fn create(&self, payload: StudentPayload) -> Result<Student> {
        validate_student(&payload)?;
        let provisional_id = format!("tmp-{}", Uuid::new_v4());
        self.begin_mutation(&provisional_id)?;

        let provisional = Student {
            id: provisional_id.clone(),
            name: payload.name.clone(),
            email: payload.email.clone(),
        };
        let result = with_optimistic_update(
            &self.students,
            |list| list.insert(0, provisional),
            self.api.create(&self.class_id, &payload),
            |list, accepted| {
                if let Some(slot) = list.iter_mut().find(|s| s.id == provisional_id) {
                    *slot = accepted.clone();
                }
            },
        )
        .await;
        self.end_mutation(&provisional_id);

        let student = result?;
        info!(class_id = %self.class_id, student_id = %student.id, "student created");
        self.invalidate_group();
        Ok(student)
    }

    /// Update a student optimistically, matched by id.
    pub async fn update(&self, id: &str, payload: StudentPayload) -> Result<Student> {
        validate_student(&payload)?;
        self.begin_mutation(id)?;

        let proposed = payload.clone();
        let result = with_optimistic_update(
            &self.students,
            |list| {
                if let Some(slot) = list.iter_mut().find(|s| s.id == id) {
                    slot.name = proposed.name;
                    slot.email = proposed.email;
                }
            },
            self.api.update(&self.class_id, id, &payload),
            |list, accepted| {
                if let Some(slot) = list.iter_mut().find(|s| s.id == id) {
                    *slot = accepted.clone();
                }
            },
        )
        .await;
        self.end_mutation(id);

        let student = result?;
        info!(class_id = %self.class_id, student_id = %id, "student updated");
        self.invalidate_group();
        Ok(student)
    }

    /// Delete a student optimistically, matched by id.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.begin_mutation(id)?;

        let result = with_optimistic_update(
            &self.students,
            |list| list.retain(|s| s.id != id),
            self.api.delete(&self.class_id, id),
            |_, _| {},
        )
        .await;
        self.end_mutation(id);

        result?;
        info!(class_id = %self.class_id, student_id = %id, "student removed");
        self.invalidate_group();
        Ok(())
    }

    /// Invite a student by e-mail. Not optimistic: nothing local changes
    /// until the invitee accepts. Returns the invite URL.
    pub async fn invite(&self, email: &str) -> Result<String> {
        validate_invite(email)?;
        let url = self.api.invite(&self.class_id, email).await?;
        info!(class_id = %self.class_id, email = %email, "invite sent");
        Ok(url)
    }

    fn begin_mutation(&self, id: &str) -> Result<(), MutationError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(id.to_string()) {
            return Err(MutationError::MutationInFlight { id: id.to_string() });
        }
        Ok(())
    }

    fn end_mutation(&self, id: &str) {
        self.in_flight.lock().remove(id);
    }

    /// Drop every cached listing for this class so query sites refetch.
    fn invalidate_group(&self) {
        let prefix = format!("students:{}", self.class_id);
        self.cache.clear_matching(move |key| key.starts_with(&prefix));
    }
}
