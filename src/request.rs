//! The request adapter: map name/value query parameters onto a plan.
//!
//! A `sql` parameter delegates the whole translation to [`Statement`];
//! a handful of well-known keys build date windows and identifier filters;
//! everything else becomes a plain equality filter. Operation and
//! collection fall back to the caller's routing defaults when the
//! parameters leave them unset.

use bson::{Bson, Document};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use tracing::debug;

use crate::plan::{Operation, QueryPlan};
use crate::statement::Statement;
use crate::value::csuuid;
use crate::{Error, Result};

const USER_ACCOUNTS: &str = "User.Accounts";

/// Routing fallbacks applied after the parameters are consumed, typically
/// taken from URL path segments.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestDefaults<'a> {
    pub operation: Option<&'a str>,
    pub collection: Option<&'a str>,
}

/// Apply an ordered name/value parameter sequence to `plan`.
pub fn parse_request<'a, I>(
    plan: &mut QueryPlan,
    params: I,
    defaults: RequestDefaults<'_>,
) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (key, value) in params {
        match key {
            // A SQL parameter owns the whole request; remaining parameters
            // are ignored on this path.
            "sql" => return Statement::new(value).build(plan),
            "VisibleAt" => visible_at(plan, value)?,
            "BirthDay" => birth_day(plan, value)?,
            "AccountId" => account_id(plan, value)?,
            "LeaveDate" => leave_date(plan, value)?,
            "groups" => groups(plan, value)?,
            _ => {
                plan.filter.insert(key, value);
            }
        }
    }

    if plan.operation.is_none() {
        if let Some(op) = defaults.operation.and_then(Operation::from_str) {
            plan.operation = Some(op);
        }
    }
    if plan.collection.is_empty() {
        if let Some(collection) = defaults.collection {
            plan.collection = collection.to_string();
        }
    }

    Ok(())
}

/// Matches documents visible in the 15 minutes leading up to the given
/// instant.
fn visible_at(plan: &mut QueryPlan, value: &str) -> Result<()> {
    let t = parse_time(value)?;
    let window_start = t - Duration::minutes(15);

    let mut window = Document::new();
    window.insert("$lte", bson::DateTime::from_chrono(t));
    window.insert("$gte", bson::DateTime::from_chrono(window_start));
    plan.filter.insert("VisibleAt", window);
    Ok(())
}

/// `DD-MM` birthday matching on month and day-of-month, ignoring the year.
fn birth_day(plan: &mut QueryPlan, value: &str) -> Result<()> {
    let (day, month) = parse_birth_day(value)?;

    let mut month_eq = Document::new();
    month_eq.insert(
        "$eq",
        Bson::Array(vec![
            Bson::Document({
                let mut d = Document::new();
                d.insert("$month", "$BirthDay");
                d
            }),
            Bson::Int32(month),
        ]),
    );
    let mut day_eq = Document::new();
    day_eq.insert(
        "$eq",
        Bson::Array(vec![
            Bson::Document({
                let mut d = Document::new();
                d.insert("$dayOfMonth", "$BirthDay");
                d
            }),
            Bson::Int32(day),
        ]),
    );

    let mut both = Document::new();
    both.insert(
        "$and",
        Bson::Array(vec![Bson::Document(month_eq), Bson::Document(day_eq)]),
    );
    plan.filter.insert("$expr", both);
    Ok(())
}

/// Devices reachable for an account: join through User to Account and
/// require module 14 access. A malformed UUID is a hard error here.
fn account_id(plan: &mut QueryPlan, value: &str) -> Result<()> {
    let uid = csuuid(value)?;

    plan.operation = Some(Operation::Aggregate);
    plan.collection = "Device".to_string();
    plan.pipeline = vec![
        bson::doc! {"$lookup": {
            "from": "User", "localField": "UserId",
            "foreignField": "_id", "as": "User",
        }},
        bson::doc! {"$unwind": "$User"},
        bson::doc! {"$lookup": {
            "from": "Account", "localField": USER_ACCOUNTS,
            "foreignField": "_id", "as": "AccountDetails",
        }},
        bson::doc! {"$match": {
            USER_ACCOUNTS: {"$in": [uid.clone()]},
            "User.Deleted": Bson::Null,
            "AccountDetails": {"$elemMatch": {
                "_id": uid,
                "Modules": {"$in": [14]},
            }},
        }},
        bson::doc! {"$project": {
            "_id": 1, "PushToken": 1, USER_ACCOUNTS: 1,
        }},
    ];
    Ok(())
}

/// Documents whose LeaveDate falls anywhere on the given day.
fn leave_date(plan: &mut QueryPlan, value: &str) -> Result<()> {
    let day = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| Error::Parameter {
        name: "LeaveDate".to_string(),
        value: value.to_string(),
    })?;
    let start = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::Parameter {
            name: "LeaveDate".to_string(),
            value: value.to_string(),
        })?
        .and_utc();
    let end = start + Duration::hours(24);

    let mut range = Document::new();
    range.insert("$gte", bson::DateTime::from_chrono(start));
    range.insert("$lt", bson::DateTime::from_chrono(end));
    plan.filter.insert("LeaveDate", range);
    Ok(())
}

/// Membership of a group, matched against the embedded group ids.
fn groups(plan: &mut QueryPlan, value: &str) -> Result<()> {
    let uid = csuuid(value)?;
    let mut membership = Document::new();
    membership.insert("$in", Bson::Array(vec![Bson::Binary(uid)]));
    plan.filter.insert("Groups._id", membership);
    Ok(())
}

/// Try the supported time formats in order. A trailing zone abbreviation
/// after the numeric offset is tolerated and ignored.
fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Utc));
    }

    let without_zone_name = value
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .trim_end();
    if let Ok(t) = DateTime::parse_from_str(without_zone_name, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Ok(t.with_timezone(&Utc));
    }

    if let Ok(t) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(t.and_utc());
    }

    debug!(value, "no time format matched");
    Err(Error::Time(value.to_string()))
}

fn parse_birth_day(value: &str) -> Result<(i32, i32)> {
    let invalid = || Error::Parameter {
        name: "BirthDay".to_string(),
        value: value.to_string(),
    };

    let (day, month) = value.split_once('-').ok_or_else(invalid)?;
    let day = day.parse::<i32>().map_err(|_| invalid())?;
    let month = month.parse::<i32>().map_err(|_| invalid())?;
    Ok((day, month))
}
