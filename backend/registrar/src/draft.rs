//! Registration drafts: field model, optimistic error clearing and validation.
//!
//! A draft is mutated one field at a time as the registrant edits the form.
//! Two checks exist:
//!
//! * [`RegistrationDraft::is_plausibly_complete`]: cheap and synchronous, only
//!   used to decide whether the submit button is enabled.
//! * [`RegistrationDraft::full_validate`]: authoritative. Re-checks every
//!   field's presence and format and asks the backend whether the email and
//!   university register number are still unused.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use validator::ValidateEmail;

use crate::backend::Backend;
use crate::errors::{PortalError, Result};

/// Ceiling for the applicant photo and the ID proof copy.
pub const IMAGE_LIMIT_BYTES: u64 = 2 * 1024 * 1024;
/// Ceiling for certificates and the signature.
pub const CERTIFICATE_LIMIT_BYTES: u64 = 5 * 1024 * 1024;

pub const GENDER_OPTIONS: &[&str] = &["Male", "Female", "Other"];
pub const LUNCH_OPTIONS: &[&str] = &["VEG", "NON-VEG"];
pub const COMPANION_OPTIONS: &[&str] = &[
    "None",
    "1 Veg",
    "1 Non veg",
    "2 Veg",
    "2 Non Veg",
    "1 Veg and 1 Non veg",
];

static MOBILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{10}$").expect("valid regex"));
static NATIONAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{12}$").expect("valid regex"));
static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{4}$").expect("valid regex"));

// ─────────────────────────────────────────────────────────
// Fields
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftField {
    Name,
    DateOfBirth,
    Gender,
    GuardianName,
    Nationality,
    Religion,
    Email,
    MobileNumber,
    NationalIdNumber,
    PlaceOfBirth,
    Community,
    MotherTongue,
    UniversityRegisterNo,
    DegreeName,
    UniversityName,
    DegreePattern,
    ConvocationYear,
    IsRegisteredGraduate,
    Photo,
    IdProof,
    ResidenceCertificate,
    DegreeCertificate,
    OtherUniversityCertificate,
    Signature,
    LunchPreference,
    CompanionOption,
    Declaration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Flag,
    Document,
}

impl DraftField {
    pub const ALL: [DraftField; 27] = [
        Self::Name,
        Self::DateOfBirth,
        Self::Gender,
        Self::GuardianName,
        Self::Nationality,
        Self::Religion,
        Self::Email,
        Self::MobileNumber,
        Self::NationalIdNumber,
        Self::PlaceOfBirth,
        Self::Community,
        Self::MotherTongue,
        Self::UniversityRegisterNo,
        Self::DegreeName,
        Self::UniversityName,
        Self::DegreePattern,
        Self::ConvocationYear,
        Self::IsRegisteredGraduate,
        Self::Photo,
        Self::IdProof,
        Self::ResidenceCertificate,
        Self::DegreeCertificate,
        Self::OtherUniversityCertificate,
        Self::Signature,
        Self::LunchPreference,
        Self::CompanionOption,
        Self::Declaration,
    ];

    pub fn kind(self) -> FieldKind {
        match self {
            Self::IsRegisteredGraduate | Self::Declaration => FieldKind::Flag,
            Self::Photo
            | Self::IdProof
            | Self::ResidenceCertificate
            | Self::DegreeCertificate
            | Self::OtherUniversityCertificate
            | Self::Signature => FieldKind::Document,
            _ => FieldKind::Text,
        }
    }

    /// Fields whose emptiness is valid on its own. Clearing them never leaves
    /// a stale error behind.
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            Self::Email | Self::UniversityRegisterNo | Self::OtherUniversityCertificate
        )
    }

    /// Upload ceiling for document fields.
    pub fn size_limit(self) -> Option<u64> {
        match self {
            Self::Photo | Self::IdProof => Some(IMAGE_LIMIT_BYTES),
            Self::ResidenceCertificate
            | Self::DegreeCertificate
            | Self::OtherUniversityCertificate
            | Self::Signature => Some(CERTIFICATE_LIMIT_BYTES),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::DateOfBirth => "Date of birth",
            Self::Gender => "Gender",
            Self::GuardianName => "Guardian name",
            Self::Nationality => "Nationality",
            Self::Religion => "Religion",
            Self::Email => "Email",
            Self::MobileNumber => "Mobile number",
            Self::NationalIdNumber => "ID number",
            Self::PlaceOfBirth => "Place of birth",
            Self::Community => "Community",
            Self::MotherTongue => "Mother tongue",
            Self::UniversityRegisterNo => "University register number",
            Self::DegreeName => "Degree name",
            Self::UniversityName => "University name",
            Self::DegreePattern => "Degree pattern",
            Self::ConvocationYear => "Convocation year",
            Self::IsRegisteredGraduate => "Registered graduate",
            Self::Photo => "Applicant photo",
            Self::IdProof => "ID proof",
            Self::ResidenceCertificate => "Residence certificate",
            Self::DegreeCertificate => "Degree certificate",
            Self::OtherUniversityCertificate => "Other university certificate",
            Self::Signature => "Signature",
            Self::LunchPreference => "Lunch preference",
            Self::CompanionOption => "Companion option",
            Self::Declaration => "Declaration",
        }
    }
}

impl fmt::Display for DraftField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-field error messages. Submission is blocked while this is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<DraftField, String>);

impl FieldErrors {
    pub fn insert(&mut self, field: DraftField, message: impl Into<String>) {
        self.0.insert(field, message.into());
    }

    pub fn remove(&mut self, field: DraftField) -> Option<String> {
        self.0.remove(&field)
    }

    pub fn contains(&self, field: DraftField) -> bool {
        self.0.contains_key(&field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
impl FieldErrors {
    pub fn get(&self, field: DraftField) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = DraftField> + '_ {
        self.0.keys().copied()
    }
}

// ─────────────────────────────────────────────────────────
// Documents
// ─────────────────────────────────────────────────────────

/// An uploaded document. The portal never inspects the bytes; it only
/// enforces presence and the size ceiling.
///
/// The backend reports documents it already holds as a bare storage key, so
/// a plain string deserializes as a stored document.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DocumentRepr")]
pub struct Document {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub source: DocumentSource,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentSource {
    /// Base64 content held in the draft until the registration is persisted.
    Inline { content: String },
    /// Already persisted by the backend; only a storage key is kept.
    Stored { key: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentRepr {
    Full {
        file_name: String,
        content_type: String,
        #[serde(default)]
        size_bytes: u64,
        source: DocumentSource,
    },
    Key(String),
}

impl From<DocumentRepr> for Document {
    fn from(repr: DocumentRepr) -> Self {
        match repr {
            DocumentRepr::Full {
                file_name,
                content_type,
                size_bytes,
                source,
            } => Self {
                file_name,
                content_type,
                size_bytes,
                source,
            },
            DocumentRepr::Key(key) => Self {
                file_name: key.rsplit('/').next().unwrap_or_default().to_string(),
                content_type: default_content_type(),
                size_bytes: 0,
                source: DocumentSource::Stored { key },
            },
        }
    }
}

/// Document payload as sent by the form.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedDocument {
    pub file_name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Base64-encoded file bytes.
    pub content: String,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Document {
    pub fn inline(file_name: &str, content_type: &str, bytes: &[u8]) -> Self {
        Self {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            size_bytes: bytes.len() as u64,
            source: DocumentSource::Inline {
                content: STANDARD.encode(bytes),
            },
        }
    }

    pub fn from_upload(upload: UploadedDocument) -> Result<Self> {
        let bytes = STANDARD.decode(upload.content.trim())?;
        Ok(Self::inline(&upload.file_name, &upload.content_type, &bytes))
    }

    pub fn is_stored(&self) -> bool {
        matches!(self.source, DocumentSource::Stored { .. })
    }

    pub fn summary(&self) -> Value {
        json!({
            "file_name": self.file_name,
            "content_type": self.content_type,
            "size_bytes": self.size_bytes,
            "stored": self.is_stored(),
        })
    }
}

// Contents are elided so drafts can be logged safely.
impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("size_bytes", &self.size_bytes)
            .field("stored", &self.is_stored())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────
// Draft
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationDraft {
    pub name: String,
    pub date_of_birth: String,
    pub gender: String,
    pub guardian_name: String,
    pub nationality: String,
    pub religion: String,
    pub email: String,
    pub mobile_number: String,
    pub national_id_number: String,
    pub place_of_birth: String,
    pub community: String,
    pub mother_tongue: String,
    pub university_register_no: String,
    pub degree_name: String,
    pub university_name: String,
    pub degree_pattern: String,
    pub convocation_year: String,
    pub is_registered_graduate: bool,
    pub photo: Option<Document>,
    pub id_proof: Option<Document>,
    pub residence_certificate: Option<Document>,
    pub degree_certificate: Option<Document>,
    pub other_university_certificate: Option<Document>,
    pub signature: Option<Document>,
    pub lunch_preference: String,
    pub companion_option: String,
    pub declaration: bool,
}

/// Borrowed view of a single field's current value.
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    Text(&'a str),
    Flag(bool),
    Document(Option<&'a Document>),
}

impl FieldRef<'_> {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Flag(_) => false,
            Self::Document(doc) => doc.is_none(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String((*s).to_string()),
            Self::Flag(b) => Value::Bool(*b),
            Self::Document(Some(doc)) => doc.summary(),
            Self::Document(None) => Value::Null,
        }
    }
}

/// A single edit coming from the form: `{"field": "...", "value": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldUpdate {
    pub field: DraftField,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Text(String),
    Document(UploadedDocument),
    Cleared,
}

impl RegistrationDraft {
    pub fn get(&self, field: DraftField) -> FieldRef<'_> {
        use DraftField::*;
        match field {
            IsRegisteredGraduate => FieldRef::Flag(self.is_registered_graduate),
            Declaration => FieldRef::Flag(self.declaration),
            Photo | IdProof | ResidenceCertificate | DegreeCertificate
            | OtherUniversityCertificate | Signature => {
                FieldRef::Document(self.document(field).and_then(Option::as_ref))
            }
            _ => FieldRef::Text(self.text(field).map(String::as_str).unwrap_or("")),
        }
    }

    fn text(&self, field: DraftField) -> Option<&String> {
        use DraftField::*;
        Some(match field {
            Name => &self.name,
            DateOfBirth => &self.date_of_birth,
            Gender => &self.gender,
            GuardianName => &self.guardian_name,
            Nationality => &self.nationality,
            Religion => &self.religion,
            Email => &self.email,
            MobileNumber => &self.mobile_number,
            NationalIdNumber => &self.national_id_number,
            PlaceOfBirth => &self.place_of_birth,
            Community => &self.community,
            MotherTongue => &self.mother_tongue,
            UniversityRegisterNo => &self.university_register_no,
            DegreeName => &self.degree_name,
            UniversityName => &self.university_name,
            DegreePattern => &self.degree_pattern,
            ConvocationYear => &self.convocation_year,
            LunchPreference => &self.lunch_preference,
            CompanionOption => &self.companion_option,
            _ => return None,
        })
    }

    fn text_mut(&mut self, field: DraftField) -> Option<&mut String> {
        use DraftField::*;
        Some(match field {
            Name => &mut self.name,
            DateOfBirth => &mut self.date_of_birth,
            Gender => &mut self.gender,
            GuardianName => &mut self.guardian_name,
            Nationality => &mut self.nationality,
            Religion => &mut self.religion,
            Email => &mut self.email,
            MobileNumber => &mut self.mobile_number,
            NationalIdNumber => &mut self.national_id_number,
            PlaceOfBirth => &mut self.place_of_birth,
            Community => &mut self.community,
            MotherTongue => &mut self.mother_tongue,
            UniversityRegisterNo => &mut self.university_register_no,
            DegreeName => &mut self.degree_name,
            UniversityName => &mut self.university_name,
            DegreePattern => &mut self.degree_pattern,
            ConvocationYear => &mut self.convocation_year,
            LunchPreference => &mut self.lunch_preference,
            CompanionOption => &mut self.companion_option,
            _ => return None,
        })
    }

    fn document(&self, field: DraftField) -> Option<&Option<Document>> {
        use DraftField::*;
        Some(match field {
            Photo => &self.photo,
            IdProof => &self.id_proof,
            ResidenceCertificate => &self.residence_certificate,
            DegreeCertificate => &self.degree_certificate,
            OtherUniversityCertificate => &self.other_university_certificate,
            Signature => &self.signature,
            _ => return None,
        })
    }

    fn document_mut(&mut self, field: DraftField) -> Option<&mut Option<Document>> {
        use DraftField::*;
        Some(match field {
            Photo => &mut self.photo,
            IdProof => &mut self.id_proof,
            ResidenceCertificate => &mut self.residence_certificate,
            DegreeCertificate => &mut self.degree_certificate,
            OtherUniversityCertificate => &mut self.other_university_certificate,
            Signature => &mut self.signature,
            _ => return None,
        })
    }

    /// Write one field. Returns an error if the value does not fit the field's kind.
    pub fn set(&mut self, field: DraftField, value: FieldValue) -> Result<()> {
        match (field.kind(), value) {
            (FieldKind::Text, FieldValue::Text(text)) => {
                if let Some(slot) = self.text_mut(field) {
                    *slot = text;
                }
            }
            (FieldKind::Text, FieldValue::Cleared) => {
                if let Some(slot) = self.text_mut(field) {
                    slot.clear();
                }
            }
            (FieldKind::Flag, FieldValue::Flag(flag)) => match field {
                DraftField::Declaration => self.declaration = flag,
                _ => self.is_registered_graduate = flag,
            },
            (FieldKind::Document, FieldValue::Document(upload)) => {
                let doc = Document::from_upload(upload)?;
                if let Some(slot) = self.document_mut(field) {
                    *slot = Some(doc);
                }
            }
            (FieldKind::Document, FieldValue::Cleared) => {
                if let Some(slot) = self.document_mut(field) {
                    *slot = None;
                }
            }
            _ => {
                let mut errors = FieldErrors::default();
                errors.insert(field, format!("Unexpected value for {}", field.label()));
                return Err(PortalError::Validation(errors));
            }
        }
        Ok(())
    }

    /// Every required field is filled in. Formats are not checked.
    pub fn is_plausibly_complete(&self) -> bool {
        DraftField::ALL
            .iter()
            .filter(|field| self.is_required(**field))
            .all(|field| match self.get(*field) {
                FieldRef::Flag(_) if *field == DraftField::Declaration => self.declaration,
                value => !value.is_empty(),
            })
    }

    fn is_required(&self, field: DraftField) -> bool {
        match field {
            DraftField::OtherUniversityCertificate => self.is_registered_graduate,
            DraftField::IsRegisteredGraduate => false,
            other => !other.is_optional(),
        }
    }

    /// Presence and format checks that need no network.
    pub fn check_fields(&self) -> FieldErrors {
        let mut errors = FieldErrors::default();

        for field in DraftField::ALL {
            let value = self.get(field);
            if field.kind() == FieldKind::Text && self.is_required(field) && value.is_empty() {
                errors.insert(field, format!("{} is required", field.label()));
            }
        }

        if !self.date_of_birth.trim().is_empty()
            && NaiveDate::parse_from_str(self.date_of_birth.trim(), "%Y-%m-%d").is_err()
        {
            errors.insert(
                DraftField::DateOfBirth,
                "Date of birth must be a valid date (YYYY-MM-DD)",
            );
        }
        if !MOBILE_RE.is_match(self.mobile_number.trim()) {
            errors.insert(
                DraftField::MobileNumber,
                "Mobile number must be exactly 10 digits",
            );
        }
        if !NATIONAL_ID_RE.is_match(self.national_id_number.trim()) {
            errors.insert(
                DraftField::NationalIdNumber,
                "ID number must be exactly 12 digits",
            );
        }
        if !self.convocation_year.trim().is_empty() && !YEAR_RE.is_match(self.convocation_year.trim())
        {
            errors.insert(
                DraftField::ConvocationYear,
                "Convocation year must be a 4-digit year",
            );
        }
        let email = self.email.trim();
        if !email.is_empty() && !is_valid_email(email) {
            errors.insert(DraftField::Email, "Valid email is required");
        }

        check_option(&mut errors, DraftField::Gender, &self.gender, GENDER_OPTIONS);
        check_option(
            &mut errors,
            DraftField::LunchPreference,
            &self.lunch_preference,
            LUNCH_OPTIONS,
        );
        check_option(
            &mut errors,
            DraftField::CompanionOption,
            &self.companion_option,
            COMPANION_OPTIONS,
        );

        for field in DraftField::ALL
            .into_iter()
            .filter(|f| f.kind() == FieldKind::Document)
        {
            let doc = self.document(field).and_then(Option::as_ref);
            let limit = field.size_limit().unwrap_or(CERTIFICATE_LIMIT_BYTES);
            match doc {
                None if self.is_required(field) => {
                    errors.insert(field, format!("{} is required", field.label()));
                }
                Some(doc) if doc.size_bytes > limit => {
                    errors.insert(
                        field,
                        format!(
                            "{} must be at most {} MB",
                            field.label(),
                            limit / (1024 * 1024)
                        ),
                    );
                }
                _ => {}
            }
        }

        if !self.declaration {
            errors.insert(DraftField::Declaration, "You must accept the declaration");
        }

        errors
    }

    /// Authoritative validation. Field checks plus remote uniqueness lookups.
    ///
    /// A failed lookup counts as "already taken": the registrant sees a field
    /// error and can retry, but an unverified value never passes.
    pub async fn full_validate(&self, backend: &dyn Backend) -> FieldErrors {
        let mut errors = self.check_fields();

        let email = self.email.trim();
        if !email.is_empty() && !errors.contains(DraftField::Email) {
            match backend.check_email(email).await {
                Ok(false) => {}
                Ok(true) => errors.insert(DraftField::Email, "Email is already registered"),
                Err(e) => {
                    warn!("Email uniqueness check failed: {e}");
                    errors.insert(
                        DraftField::Email,
                        "Email could not be verified, please try again",
                    );
                }
            }
        }

        let register_no = self.university_register_no.trim();
        if !register_no.is_empty() && !errors.contains(DraftField::UniversityRegisterNo) {
            match backend.check_register_no(register_no).await {
                Ok(false) => {}
                Ok(true) => errors.insert(
                    DraftField::UniversityRegisterNo,
                    "University register number is already registered",
                ),
                Err(e) => {
                    warn!("Register number uniqueness check failed: {e}");
                    errors.insert(
                        DraftField::UniversityRegisterNo,
                        "University register number could not be verified, please try again",
                    );
                }
            }
        }

        errors
    }

    /// Field values for display, with document contents replaced by summaries.
    pub fn summary(&self) -> BTreeMap<DraftField, Value> {
        DraftField::ALL
            .into_iter()
            .map(|field| (field, self.get(field).to_json()))
            .collect()
    }

    /// Fill empty fields from an earlier submission. Values the registrant has
    /// already typed again are kept.
    pub fn prefill_from(&mut self, previous: &RegistrationDraft) {
        for field in DraftField::ALL {
            match field.kind() {
                FieldKind::Text => {
                    let prior = previous.text(field).cloned().unwrap_or_default();
                    if let Some(slot) = self.text_mut(field) {
                        if slot.trim().is_empty() {
                            *slot = prior;
                        }
                    }
                }
                FieldKind::Document => {
                    let prior = previous.document(field).cloned().flatten();
                    if let Some(slot) = self.document_mut(field) {
                        if slot.is_none() {
                            *slot = prior;
                        }
                    }
                }
                FieldKind::Flag => {}
            }
        }
        self.is_registered_graduate |= previous.is_registered_graduate;
    }
}

fn is_valid_email(email: &str) -> bool {
    let has_dotted_domain = email
        .rsplit_once('@')
        .map(|(_, domain)| domain.contains('.') && !domain.ends_with('.'))
        .unwrap_or(false);
    email.validate_email() && has_dotted_domain
}

fn check_option(errors: &mut FieldErrors, field: DraftField, value: &str, options: &[&str]) {
    let value = value.trim();
    if !value.is_empty() && !options.contains(&value) {
        errors.insert(field, format!("{} must be one of: {}", field.label(), options.join(", ")));
    }
}

// ─────────────────────────────────────────────────────────
// Snapshot (what the draft store persists)
// ─────────────────────────────────────────────────────────

/// A draft together with the errors last shown for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftSnapshot {
    pub draft: RegistrationDraft,
    pub errors: FieldErrors,
}

impl DraftSnapshot {
    /// Apply an edit. The field's previous error is dropped when the new value
    /// is non-empty or the field is optional; it is not re-validated here.
    pub fn apply(&mut self, update: FieldUpdate) -> Result<DraftField> {
        let field = update.field;
        self.draft.set(field, update.value)?;
        if field.is_optional() || !self.draft.get(field).is_empty() {
            self.errors.remove(field);
        }
        Ok(field)
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
