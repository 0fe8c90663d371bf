use {
    super::messages::*,
    ndarray::Array1,
    nom::{
        branch::alt,
        bytes::complete::{tag, take_until, take_while1},
        character::complete::{char, digit1},
        combinator::{all_consuming, fail, map, map_res, opt, recognize, rest},
        error::{FromExternalError, ParseError},
        multi::separated_list1,
        sequence::{delimited, pair, preceded, separated_pair},
        IResult,
    },
    std::num::{ParseFloatError, ParseIntError},
};

enum GrblStatusPart {
    Position(GrblPosition),
    WorkCoordinateOffset(Array1<f64>),
    CurrentFeed(f64),
    CurrentSpindle(f64),
    Planner(u64),
    RxBytes(u64),
    LineNumber(u64),
    Pins(String),
    Unknown(String),
}
fn apply_grbl_status(mut status: GrblStatus, part: GrblStatusPart) -> GrblStatus {
    match part {
        GrblStatusPart::Position(position) => status.position = Some(position),
        GrblStatusPart::WorkCoordinateOffset(wco) => status.work_coordinate_offset = Some(wco),
        GrblStatusPart::CurrentFeed(feed) => status.current_feed = Some(feed),
        GrblStatusPart::CurrentSpindle(spindle) => status.current_spindle = Some(spindle),
        GrblStatusPart::Planner(planner) => status.planner = Some(planner),
        GrblStatusPart::RxBytes(rx_bytes) => status.rx_bytes = Some(rx_bytes),
        GrblStatusPart::LineNumber(line_number) => status.line_number = Some(line_number),
        GrblStatusPart::Pins(pins) => status.pins = Some(pins),
        GrblStatusPart::Unknown(unknown) => status.unknown_terms.push(unknown),
    };
    status
}

fn enclosed_by<'a, Error: 'a + ParseError<&'a str>>(
    open: &'a str,
    close: &'a str,
) -> impl 'a + FnMut(&'a str) -> IResult<&'a str, &'a str, Error> {
    delimited(tag(open), take_until(close), tag(close))
}

fn parse_f64<'a, Error>(input: &'a str) -> IResult<&'a str, f64, Error>
where
    Error: ParseError<&'a str> + FromExternalError<&'a str, ParseFloatError>,
{
    map_res(
        take_while1(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == '+'),
        |substr: &str| substr.parse::<f64>(),
    )(input)
}
fn parse_i64<'a, Error>(input: &'a str) -> IResult<&'a str, i64, Error>
where
    Error: ParseError<&'a str> + FromExternalError<&'a str, ParseIntError>,
{
    map_res(recognize(pair(opt(char('-')), digit1)), |substr: &str| {
        substr.parse::<i64>()
    })(input)
}
fn parse_u64<'a, Error>(input: &'a str) -> IResult<&'a str, u64, Error>
where
    Error: ParseError<&'a str> + FromExternalError<&'a str, ParseIntError>,
{
    map_res(digit1, |substr: &str| substr.parse::<u64>())(input)
}
fn parse_float_array<'a, Error>(input: &'a str) -> IResult<&'a str, Array1<f64>, Error>
where
    Error: ParseError<&'a str> + FromExternalError<&'a str, ParseFloatError>,
{
    map(separated_list1(tag(","), parse_f64), |floats: Vec<f64>| {
        Array1::from(floats)
    })(input)
}

fn parse_grbl_state<'a, Error>(input: &'a str) -> IResult<&'a str, GrblState, Error>
where
    Error: ParseError<&'a str> + FromExternalError<&'a str, ParseIntError>,
{
    let (input, name) = take_while1(|c: char| c.is_ascii_alphabetic())(input)?;
    let (input, substate) = opt(preceded(tag(":"), parse_i64))(input)?;
    let state = match name {
        "Idle" => GrblState::Idle,
        "Run" => GrblState::Run,
        "Hold" => GrblState::Hold(substate.unwrap_or(0)),
        "Jog" => GrblState::Jog,
        "Alarm" => GrblState::Alarm,
        "Door" => GrblState::Door(substate.unwrap_or(0)),
        "Check" => GrblState::Check,
        "Home" => GrblState::Home,
        "Sleep" => GrblState::Sleep,
        _ => return fail(input),
    };
    Ok((input, state))
}

fn whole<'a, O>(
    parser: impl FnMut(&'a str) -> IResult<&'a str, O, ()>,
    input: &'a str,
) -> Option<O> {
    all_consuming(parser)(input).ok().map(|(_, value)| value)
}

// One `Name:value` field of a status report. Anything unexpected is kept verbatim.
fn parse_status_field(field: &str) -> Vec<GrblStatusPart> {
    let unknown = || vec![GrblStatusPart::Unknown(field.to_string())];
    let Some((head, value)) = field.split_once(':') else {
        return unknown();
    };
    let parts = match head {
        "MPos" => whole(parse_float_array, value)
            .map(|pos| vec![GrblStatusPart::Position(GrblPosition::Machine(pos))]),
        "WPos" => whole(parse_float_array, value)
            .map(|pos| vec![GrblStatusPart::Position(GrblPosition::Work(pos))]),
        "WCO" => whole(parse_float_array, value)
            .map(|wco| vec![GrblStatusPart::WorkCoordinateOffset(wco)]),
        "Bf" => whole(separated_pair(parse_u64, tag(","), parse_u64), value).map(
            |(planner, rx_bytes)| {
                vec![
                    GrblStatusPart::Planner(planner),
                    GrblStatusPart::RxBytes(rx_bytes),
                ]
            },
        ),
        "Buf" => whole(parse_u64, value).map(|planner| vec![GrblStatusPart::Planner(planner)]),
        "RX" => whole(parse_u64, value).map(|rx| vec![GrblStatusPart::RxBytes(rx)]),
        "Ln" => whole(parse_u64, value).map(|ln| vec![GrblStatusPart::LineNumber(ln)]),
        "F" => whole(parse_f64, value).map(|feed| vec![GrblStatusPart::CurrentFeed(feed)]),
        "FS" => whole(separated_pair(parse_f64, tag(","), parse_f64), value).map(
            |(feed, spindle)| {
                vec![
                    GrblStatusPart::CurrentFeed(feed),
                    GrblStatusPart::CurrentSpindle(spindle),
                ]
            },
        ),
        "Pn" => Some(vec![GrblStatusPart::Pins(value.to_string())]),
        _ => None,
    };
    parts.unwrap_or_else(unknown)
}

// Grbl 0.9 separates fields and coordinates with the same comma:
// `MPos:0.000,0.000,0.000,WPos:...`. Glue coordinates back onto their field.
fn regroup_legacy_fields(fields: &str) -> Vec<String> {
    let mut grouped: Vec<String> = Vec::new();
    for token in fields.split(',') {
        match grouped.last_mut() {
            Some(last) if !token.contains(':') => {
                last.push(',');
                last.push_str(token);
            }
            _ => grouped.push(token.to_string()),
        }
    }
    grouped
}

fn parse_grbl_status<'a, Error>(input: &'a str) -> IResult<&'a str, GrblStatus, Error>
where
    Error: 'a
        + ParseError<&'a str>
        + FromExternalError<&'a str, ParseIntError>
        + FromExternalError<&'a str, ParseFloatError>,
{
    let (remaining, body) = enclosed_by("<", ">")(input)?;
    let (fields, state) = parse_grbl_state(body)?;
    let parts: Vec<GrblStatusPart> = if let Some(fields) = fields.strip_prefix('|') {
        fields.split('|').flat_map(parse_status_field).collect()
    } else if let Some(fields) = fields.strip_prefix(',') {
        regroup_legacy_fields(fields)
            .iter()
            .flat_map(|field| parse_status_field(field))
            .collect()
    } else if fields.is_empty() {
        Vec::new()
    } else {
        return fail(input);
    };
    let status = parts.into_iter().fold(GrblStatus::new(state), apply_grbl_status);
    Ok((remaining, status))
}

fn parse_grbl_line_impl<'a, Error>(message: &'a str) -> IResult<&'a str, GrblMessage, Error>
where
    Error: 'a
        + ParseError<&'a str>
        + FromExternalError<&'a str, ParseIntError>
        + FromExternalError<&'a str, ParseFloatError>,
{
    alt((
        map(parse_grbl_status, GrblMessage::StatusEvent),
        map(all_consuming(tag("ok")), |_| GrblMessage::GrblOk),
        map(preceded(tag("error:"), parse_u64), GrblMessage::GrblError),
        map(preceded(tag("ALARM:"), parse_u64), GrblMessage::GrblAlarm),
        map(recognize(pair(tag("Grbl"), rest)), |greeting: &str| {
            GrblMessage::GrblGreeting(greeting.to_string())
        }),
        map(enclosed_by("[", "]"), |inner: &str| {
            GrblMessage::Feedback(inner.to_string())
        }),
        map(
            preceded(tag("$"), separated_pair(parse_u64, tag("="), rest)),
            |(index, value): (u64, &str)| GrblMessage::Setting {
                index,
                value: value.to_string(),
            },
        ),
        map(rest, |msg: &str| GrblMessage::Unrecognized(msg.to_string())),
    ))(message)
}

pub fn parse_grbl_line(message: &str) -> GrblMessage {
    let line = message.trim();
    match parse_grbl_line_impl::<()>(line) {
        Ok((_, parsed)) => parsed,
        Err(_) => GrblMessage::Unrecognized(line.to_string()),
    }
}
