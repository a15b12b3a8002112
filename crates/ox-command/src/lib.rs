#![forbid(unsafe_code)]

//! Maps tokenized request lines onto engine operations. Arity and
//! numeric arguments are validated before the engine is touched, so a
//! rejected command never mutates anything; every outcome, including
//! failure, is a rendered reply.

use ox_protocol::Reply;
use ox_store::{Engine, StoreError, TtlValue, ZMember};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandId {
    Set,
    Get,
    Del,
    Keys,
    Zadd,
    Zrem,
    Zscore,
    Zquery,
    Zshow,
    Pexpire,
    Pttl,
}

fn classify(cmd: &str) -> Option<CommandId> {
    const TABLE: &[(&str, CommandId)] = &[
        ("set", CommandId::Set),
        ("get", CommandId::Get),
        ("del", CommandId::Del),
        ("keys", CommandId::Keys),
        ("zadd", CommandId::Zadd),
        ("zrem", CommandId::Zrem),
        ("zscore", CommandId::Zscore),
        ("zquery", CommandId::Zquery),
        ("zshow", CommandId::Zshow),
        ("pexpire", CommandId::Pexpire),
        ("pttl", CommandId::Pttl),
    ];
    TABLE
        .iter()
        .find(|(name, _)| cmd.eq_ignore_ascii_case(name))
        .map(|(_, id)| *id)
}

/// Execute one tokenized request against the engine.
pub fn dispatch(argv: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    let Some((cmd, args)) = argv.split_first() else {
        return Reply::SyntaxError;
    };
    match classify(cmd) {
        Some(CommandId::Set) => set(args, engine, now_ms),
        Some(CommandId::Get) => get(args, engine, now_ms),
        Some(CommandId::Del) => del(args, engine, now_ms),
        Some(CommandId::Keys) => keys(args, engine, now_ms),
        Some(CommandId::Zadd) => zadd(args, engine, now_ms),
        Some(CommandId::Zrem) => zrem(args, engine, now_ms),
        Some(CommandId::Zscore) => zscore(args, engine, now_ms),
        Some(CommandId::Zquery) => zquery(args, engine, now_ms),
        Some(CommandId::Zshow) => zshow(args, engine, now_ms),
        Some(CommandId::Pexpire) => pexpire(args, engine, now_ms),
        Some(CommandId::Pttl) => pttl(args, engine, now_ms),
        None => Reply::SyntaxError,
    }
}

fn set(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 2 {
        return Reply::SyntaxError;
    }
    engine.set(args[0], args[1], now_ms);
    Reply::Ok
}

fn get(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 1 {
        return Reply::SyntaxError;
    }
    match engine.get(args[0], now_ms) {
        Some(value) => Reply::Value(value.to_string()),
        None => Reply::Nil,
    }
}

fn del(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 1 {
        return Reply::SyntaxError;
    }
    if engine.del(args[0], now_ms) {
        Reply::Ok
    } else {
        Reply::Ko
    }
}

fn keys(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if !args.is_empty() {
        return Reply::SyntaxError;
    }
    let mut keys = engine.keys(now_ms);
    keys.sort_unstable();
    Reply::Lines(keys)
}

fn zadd(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 3 {
        return Reply::SyntaxError;
    }
    let Ok(score) = args[1].parse::<f64>() else {
        return Reply::SyntaxError;
    };
    match engine.zadd(args[0], score, args[2], now_ms) {
        Ok(_) => Reply::Ok,
        Err(StoreError::WrongType) => Reply::WrongTypeError,
    }
}

fn zrem(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 2 {
        return Reply::SyntaxError;
    }
    match engine.zrem(args[0], args[1], now_ms) {
        Ok(true) => Reply::Ok,
        Ok(false) => Reply::Ko,
        Err(StoreError::WrongType) => Reply::WrongTypeError,
    }
}

fn zscore(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 2 {
        return Reply::SyntaxError;
    }
    match engine.zscore(args[0], args[1], now_ms) {
        Ok(Some(score)) => Reply::Value(score.to_string()),
        Ok(None) => Reply::Nil,
        Err(StoreError::WrongType) => Reply::WrongTypeError,
    }
}

fn zquery(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 5 {
        return Reply::SyntaxError;
    }
    let Ok(score) = args[1].parse::<f64>() else {
        return Reply::SyntaxError;
    };
    let Ok(offset) = args[3].parse::<i64>() else {
        return Reply::SyntaxError;
    };
    let Ok(limit) = args[4].parse::<usize>() else {
        return Reply::SyntaxError;
    };
    match engine.zquery(args[0], score, args[2], offset, limit, now_ms) {
        Ok(members) => Reply::Lines(listing(&members)),
        Err(StoreError::WrongType) => Reply::WrongTypeError,
    }
}

fn zshow(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 1 {
        return Reply::SyntaxError;
    }
    match engine.zshow(args[0], now_ms) {
        Ok(Some(members)) => Reply::Lines(listing(&members)),
        Ok(None) => Reply::Nil,
        Err(StoreError::WrongType) => Reply::WrongTypeError,
    }
}

fn pexpire(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 2 {
        return Reply::SyntaxError;
    }
    let Ok(ttl_ms) = args[1].parse::<i64>() else {
        return Reply::SyntaxError;
    };
    if engine.expire(args[0], ttl_ms, now_ms) {
        Reply::Ok
    } else {
        Reply::Nil
    }
}

fn pttl(args: &[&str], engine: &mut Engine, now_ms: u64) -> Reply {
    if args.len() != 1 {
        return Reply::SyntaxError;
    }
    match engine.ttl(args[0], now_ms) {
        TtlValue::KeyMissing => Reply::Nil,
        TtlValue::NoExpiry => Reply::Value("-1".to_string()),
        TtlValue::Remaining(ms) => Reply::Value(ms.to_string()),
    }
}

fn listing(members: &[ZMember]) -> Vec<String> {
    members
        .iter()
        .enumerate()
        .map(|(i, m)| format!("{}) {} => {}", i + 1, m.score, m.name))
        .collect()
}
