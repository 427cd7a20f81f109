//! Listing commands
//!
//! Each one evaluates a projection once against the local cache.

use anyhow::Result;

use servicemaps_core::query::{
    AddressList, HouseList, KeyList, PhoneCallList, PhoneNumberList, PhoneTerritoryList,
    RecallList, RecentTerritories, TerritoryOverview, VisitList,
};
use servicemaps_core::Engine;

use crate::output::{format_date, truncate, truncate_line, Output};

fn last_visit(date: Option<i64>) -> String {
    date.map(format_date).unwrap_or_else(|| "-".to_string())
}

pub fn territories(engine: &Engine, recent: bool, output: &Output) -> Result<()> {
    if recent {
        let rows = engine
            .queries()
            .query(&RecentTerritories::default())?;
        return output.list(
            &rows,
            "territory",
            |r| {
                format!(
                    "{:>4} | {} | last visit {}",
                    r.territory.number,
                    truncate(&r.territory.description, 40),
                    format_date(r.last_visit)
                )
            },
            |r| r.territory.id.clone(),
        );
    }

    let rows = engine.queries().query(&TerritoryOverview)?;
    output.list(
        &rows,
        "territory",
        |r| {
            let keys = if r.keys.is_empty() {
                String::new()
            } else {
                format!(" [{}]", r.keys.join(", "))
            };
            format!(
                "{:>4} | {}{} | {} address(es), {} house(s) | last visit {}",
                r.territory.number,
                truncate(&r.territory.description, 35),
                keys,
                r.address_count,
                r.house_count,
                last_visit(r.last_visit)
            )
        },
        |r| r.territory.id.clone(),
    )
}

pub fn addresses(engine: &Engine, territory: String, output: &Output) -> Result<()> {
    let rows = engine.queries().query(&AddressList { territory })?;
    output.list(
        &rows,
        "address",
        |r| {
            format!(
                "{} | {} | {} house(s)",
                r.address.id,
                truncate(&r.address.address, 45),
                r.house_count
            )
        },
        |r| r.address.id.clone(),
    )
}

pub fn houses(engine: &Engine, address: String, output: &Output) -> Result<()> {
    let rows = engine.queries().query(&HouseList { address })?;
    output.list(
        &rows,
        "house",
        |r| {
            let floor = r
                .house
                .floor
                .as_deref()
                .map(|f| format!(" (floor {})", f))
                .unwrap_or_default();
            let visit = r
                .last_visit
                .as_ref()
                .map(|v| format!("{} {}", v.symbol, format_date(v.date)))
                .unwrap_or_else(|| "-".to_string());
            format!("{} | {}{} | {}", r.house.id, r.house.number, floor, visit)
        },
        |r| r.house.id.clone(),
    )
}

pub fn visits(engine: &Engine, house: String, output: &Output) -> Result<()> {
    let rows = engine.queries().query(&VisitList { house })?;
    output.list(
        &rows,
        "visit",
        |v| {
            format!(
                "[{}] {:<2} {} - {}",
                format_date(v.date),
                v.symbol,
                v.user,
                truncate_line(&v.notes, 50)
            )
        },
        |v| v.id.clone(),
    )
}

pub fn phone(engine: &Engine, territory: Option<String>, output: &Output) -> Result<()> {
    let Some(territory) = territory else {
        let rows = engine.queries().query(&PhoneTerritoryList)?;
        return output.list(
            &rows,
            "phone territory",
            |r| {
                format!(
                    "{:>4} | {} | {} number(s)",
                    r.territory.number,
                    truncate(&r.territory.description, 40),
                    r.number_count
                )
            },
            |r| r.territory.id.clone(),
        );
    };

    let rows = engine.queries().query(&PhoneNumberList { territory })?;
    output.list(
        &rows,
        "number",
        |r| {
            let call = r
                .last_call
                .as_ref()
                .map(|c| format!("called {}", format_date(c.date)))
                .unwrap_or_else(|| "never called".to_string());
            format!("{} | {} | {}", r.number.id, r.number.number, call)
        },
        |r| r.number.id.clone(),
    )
}

pub fn calls(engine: &Engine, number: String, output: &Output) -> Result<()> {
    let rows = engine.queries().query(&PhoneCallList { number })?;
    output.list(
        &rows,
        "call",
        |c| {
            format!(
                "[{}] {} - {}",
                format_date(c.date),
                c.user,
                truncate_line(&c.notes, 50)
            )
        },
        |c| c.id.clone(),
    )
}

pub fn recalls(engine: &Engine, output: &Output) -> Result<()> {
    let rows = engine.queries().query(&RecallList)?;
    output.list(
        &rows,
        "recall",
        |r| {
            format!(
                "{:>4} | {} #{} | {} | last visit {}",
                r.territory.number,
                truncate(&r.address.address, 35),
                r.house.number,
                r.recall.user,
                last_visit(r.last_visit.as_ref().map(|v| v.date))
            )
        },
        |r| r.house.id.clone(),
    )
}

pub fn keys(engine: &Engine, output: &Output) -> Result<()> {
    let rows = engine.queries().query(&KeyList)?;
    output.list(
        &rows,
        "key",
        |k| {
            let blocked = k.users.iter().filter(|u| u.blocked).count();
            format!(
                "{} | {}{} | {} territory(ies), {} user(s){}",
                k.token.id,
                truncate(&k.token.name, 30),
                if k.token.moderator { " (moderator)" } else { "" },
                k.territories.len(),
                k.users.len(),
                if blocked > 0 {
                    format!(", {} blocked", blocked)
                } else {
                    String::new()
                }
            )
        },
        |k| k.token.id.clone(),
    )
}
