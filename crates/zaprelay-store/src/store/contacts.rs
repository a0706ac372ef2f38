//! Contacts and the identity resolver.

use super::{now, rows, Store};
use tracing::debug;
use uuid::Uuid;
use zaprelay_core::{
    error::RelayError,
    model::{Contact, ContactMetadata, IdentityCandidates},
    phone,
};

impl Store {
    pub async fn get_contact(&self, id: &str) -> Result<Contact, RelayError> {
        let sql = format!("SELECT {} FROM contacts WHERE id = ?", rows::CONTACT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?
            .ok_or_else(|| RelayError::NotFound(format!("contact {id}")))?;
        rows::contact(&row)
    }

    async fn contact_by_phone(
        &self,
        instance_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, RelayError> {
        let sql = format!(
            "SELECT {} FROM contacts WHERE instance_id = ? AND phone = ?",
            rows::CONTACT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(instance_id)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        row.as_ref().map(rows::contact).transpose()
    }

    /// Find or create the contact for a phone, refreshing name and picture
    /// when the provider reports new ones. Returns `(contact, created)`.
    pub async fn upsert_contact(
        &self,
        instance_id: &str,
        raw_phone: &str,
        name: Option<&str>,
        profile_pic_url: Option<&str>,
    ) -> Result<(Contact, bool), RelayError> {
        let phone = phone::normalize(raw_phone);
        if phone.is_empty() {
            return Err(RelayError::Store(format!("unusable phone {raw_phone:?}")));
        }
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let pic = profile_pic_url.filter(|p| !p.is_empty());

        if let Some(existing) = self.contact_by_phone(instance_id, &phone).await? {
            let name_changed = name.is_some() && name != existing.name.as_deref();
            let pic_changed = pic.is_some() && pic != existing.profile_pic_url.as_deref();
            if !name_changed && !pic_changed {
                return Ok((existing, false));
            }
            sqlx::query(
                "UPDATE contacts SET name = COALESCE(?, name), \
                     profile_pic_url = COALESCE(?, profile_pic_url), updated_at = ? \
                 WHERE id = ?",
            )
            .bind(name)
            .bind(pic)
            .bind(now())
            .bind(&existing.id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("update contact failed: {e}")))?;
            return Ok((self.get_contact(&existing.id).await?, false));
        }

        let ts = now();
        let result = sqlx::query(
            "INSERT INTO contacts (id, instance_id, phone, name, profile_pic_url, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, '{}', ?, ?) \
             ON CONFLICT (instance_id, phone) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(instance_id)
        .bind(&phone)
        .bind(name)
        .bind(pic)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("insert contact failed: {e}")))?;

        let contact = self
            .contact_by_phone(instance_id, &phone)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("contact {phone}")))?;
        Ok((contact, result.rows_affected() == 1))
    }

    /// Map external identifiers to a contact of the instance.
    ///
    /// Strategies run in fixed order and the first hit wins: exact phone,
    /// last-10-digit suffix, stored CRM user id, stored CRM chat id.
    pub async fn resolve_contact(
        &self,
        instance_id: &str,
        candidates: &IdentityCandidates,
    ) -> Result<Option<Contact>, RelayError> {
        let normalized = candidates
            .phone
            .as_deref()
            .map(phone::normalize)
            .filter(|p| !p.is_empty());

        if let Some(ref p) = normalized {
            if let Some(c) = self.contact_by_phone(instance_id, p).await? {
                debug!("identity: exact phone match for {p}");
                return Ok(Some(c));
            }

            if let Some(tail) = phone::suffix(p) {
                let sql = format!(
                    "SELECT {} FROM contacts \
                     WHERE instance_id = ? AND length(phone) >= ? AND substr(phone, -?) = ? \
                     ORDER BY created_at ASC LIMIT 1",
                    rows::CONTACT_COLUMNS
                );
                let row = sqlx::query(&sql)
                    .bind(instance_id)
                    .bind(phone::SUFFIX_DIGITS as i64)
                    .bind(phone::SUFFIX_DIGITS as i64)
                    .bind(tail)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
                if let Some(row) = row {
                    debug!("identity: suffix match for {p}");
                    return Ok(Some(rows::contact(&row)?));
                }
            }
        }

        let tags = [
            ("$.crm_user_id", candidates.remote_user_id.as_deref()),
            ("$.crm_chat_id", candidates.remote_chat_id.as_deref()),
        ];
        for (path, value) in tags {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            let sql = format!(
                "SELECT {} FROM contacts \
                 WHERE instance_id = ? AND CAST(json_extract(metadata, ?) AS TEXT) = ? \
                 ORDER BY created_at ASC LIMIT 1",
                rows::CONTACT_COLUMNS
            );
            let row = sqlx::query(&sql)
                .bind(instance_id)
                .bind(path)
                .bind(value)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
            if let Some(row) = row {
                debug!("identity: metadata {path} match for {value}");
                return Ok(Some(rows::contact(&row)?));
            }
        }

        Ok(None)
    }

    /// Merge CRM identity tags into the contact's metadata. Absent tags are kept.
    pub async fn tag_contact(
        &self,
        contact_id: &str,
        crm_user_id: Option<&str>,
        crm_chat_id: Option<&str>,
    ) -> Result<ContactMetadata, RelayError> {
        let contact = self.get_contact(contact_id).await?;
        let mut metadata = contact.metadata;
        if let Some(u) = crm_user_id.filter(|v| !v.is_empty()) {
            metadata.crm_user_id = Some(u.to_string());
        }
        if let Some(c) = crm_chat_id.filter(|v| !v.is_empty()) {
            metadata.crm_chat_id = Some(c.to_string());
        }
        sqlx::query("UPDATE contacts SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(rows::to_json(&metadata)?)
            .bind(now())
            .bind(contact_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("update contact failed: {e}")))?;
        Ok(metadata)
    }
}
