use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while, take_while1},
    character::complete::{alpha1, char, u32 as dec_u32, u64 as dec_u64},
    combinator::{all_consuming, map, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

use pluto_mail::{Flag, Seq, SeqRange, SeqSet, StoreOperator};

use crate::imap::command::Command;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

/// Split a client line into its tag and the command text. Returns `None`
/// for an empty line or a tagless one.
pub fn split_tag(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (tag, rest) = line.split_once(' ')?;
    if !valid_tag(tag) {
        return None;
    }
    Some((tag, rest))
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty() && tag.chars().all(|c| is_atom_char(c) && c != '+')
}

/// Parse the command text (everything after the tag).
pub fn parse_command(input: &str) -> Result<Command, ParseError> {
    let input = input.trim_end_matches(['\r', '\n']);
    match all_consuming(command)(input) {
        Ok((_, cmd)) => Ok(cmd),
        Err(_) => Err(ParseError("unable to parse command".to_string())),
    }
}

// ---- grammar ----

fn is_atom_char(c: char) -> bool {
    c.is_ascii_graphic() && !matches!(c, '(' | ')' | '{' | '}' | '%' | '*' | '"' | '\\')
}

fn sp(input: &str) -> IResult<&str, char> {
    char(' ')(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    map(
        delimited(
            char('"'),
            take_while(|c| !matches!(c, '"' | '\r' | '\n')),
            char('"'),
        ),
        |s: &str| s.to_string(),
    )(input)
}

fn atom(input: &str) -> IResult<&str, String> {
    map(take_while1(is_atom_char), |s: &str| s.to_string())(input)
}

fn astring(input: &str) -> IResult<&str, String> {
    alt((quoted, atom))(input)
}

/// A LIST argument additionally admits the wildcards.
fn list_arg(input: &str) -> IResult<&str, String> {
    alt((
        quoted,
        map(
            take_while1(|c| is_atom_char(c) || matches!(c, '%' | '*')),
            |s: &str| s.to_string(),
        ),
    ))(input)
}

fn flag(input: &str) -> IResult<&str, Flag> {
    let (rest, name) = preceded(char('\\'), alpha1)(input)?;
    match Flag::from_imap(&format!("\\{}", name)) {
        Some(f) => Ok((rest, f)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn flag_list(input: &str) -> IResult<&str, Vec<Flag>> {
    delimited(char('('), separated_list0(sp, flag), char(')'))(input)
}

fn seq_number(input: &str) -> IResult<&str, Seq> {
    alt((value(Seq::Last, char('*')), map(dec_u32, Seq::Num)))(input)
}

fn seq_range(input: &str) -> IResult<&str, SeqRange> {
    map(
        pair(seq_number, opt(preceded(char(':'), seq_number))),
        |(from, to)| SeqRange { from, to },
    )(input)
}

fn seq_set(input: &str) -> IResult<&str, SeqSet> {
    map(separated_list1(char(','), seq_range), SeqSet)(input)
}

fn literal_size(input: &str) -> IResult<&str, usize> {
    map(delimited(char('{'), dec_u64, char('}')), |n| n as usize)(input)
}

fn store_spec(input: &str) -> IResult<&str, (StoreOperator, bool)> {
    let (input, operator) = alt((
        value(StoreOperator::Add, tag_no_case("+FLAGS")),
        value(StoreOperator::Remove, tag_no_case("-FLAGS")),
        value(StoreOperator::Replace, tag_no_case("FLAGS")),
    ))(input)?;
    let (input, silent) = map(opt(tag_no_case(".SILENT")), |s| s.is_some())(input)?;
    Ok((input, (operator, silent)))
}

fn command(input: &str) -> IResult<&str, Command> {
    alt((
        value(Command::Capability, tag_no_case("CAPABILITY")),
        value(Command::Noop, tag_no_case("NOOP")),
        value(Command::Logout, tag_no_case("LOGOUT")),
        value(Command::Expunge, tag_no_case("EXPUNGE")),
        map(
            tuple((tag_no_case("LOGIN"), sp, astring, sp, astring)),
            |(_, _, username, _, password)| Command::Login { username, password },
        ),
        map(
            preceded(pair(tag_no_case("SELECT"), sp), astring),
            |mailbox| Command::Select { mailbox },
        ),
        map(
            preceded(pair(tag_no_case("CREATE"), sp), astring),
            |mailbox| Command::Create { mailbox },
        ),
        map(
            preceded(pair(tag_no_case("DELETE"), sp), astring),
            |mailbox| Command::Delete { mailbox },
        ),
        map(
            tuple((tag_no_case("RENAME"), sp, astring, sp, astring)),
            |(_, _, from, _, to)| Command::Rename { from, to },
        ),
        map(
            tuple((tag_no_case("LIST"), sp, list_arg, sp, list_arg)),
            |(_, _, reference, _, pattern)| Command::List { reference, pattern },
        ),
        map(
            tuple((
                tag_no_case("APPEND"),
                sp,
                astring,
                opt(preceded(sp, flag_list)),
                opt(preceded(sp, quoted)), // optional date-time, accepted and ignored
                sp,
                literal_size,
            )),
            |(_, _, mailbox, flags, _, _, size)| Command::Append {
                mailbox,
                flags: flags.unwrap_or_default(),
                size,
            },
        ),
        map(
            tuple((tag_no_case("STORE"), sp, seq_set, sp, store_spec, sp, flag_list)),
            |(_, _, seqset, _, (operator, silent), _, flags)| Command::Store {
                seqset,
                operator,
                silent,
                flags,
            },
        ),
        map(
            tuple((tag_no_case("COPY"), sp, seq_set, sp, astring)),
            |(_, _, seqset, _, mailbox)| Command::Copy { seqset, mailbox },
        ),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> (String, Command) {
        let (tag, rest) = split_tag(line).unwrap();
        (tag.to_string(), parse_command(rest).unwrap())
    }

    #[test]
    fn tags_are_split_and_validated() {
        assert_eq!(split_tag("a LOGOUT\r\n").unwrap(), ("a", "LOGOUT"));
        assert_eq!(split_tag("A023 NOOP").unwrap(), ("A023", "NOOP"));
        assert!(split_tag("").is_none());
        assert!(split_tag("justoneword").is_none());
        assert!(split_tag("+ bad").is_none());
    }

    #[test]
    fn bare_commands() {
        assert!(matches!(parse("a CAPABILITY").1, Command::Capability));
        assert!(matches!(parse("a noop").1, Command::Noop));
        assert!(matches!(parse("a Logout").1, Command::Logout));
        assert!(matches!(parse("a EXPUNGE").1, Command::Expunge));
    }

    #[test]
    fn login_with_atoms_and_quoted() {
        match parse("a LOGIN user6 password6").1 {
            Command::Login { username, password } => {
                assert_eq!(username, "user6");
                assert_eq!(password, "password6");
            }
            c => panic!("wrong command {:?}", c),
        }
        match parse("a LOGIN \"user six\" \"pass word\"").1 {
            Command::Login { username, password } => {
                assert_eq!(username, "user six");
                assert_eq!(password, "pass word");
            }
            c => panic!("wrong command {:?}", c),
        }
    }

    #[test]
    fn mailbox_commands() {
        match parse("g CREATE University.").1 {
            Command::Create { mailbox } => assert_eq!(mailbox, "University."),
            c => panic!("wrong command {:?}", c),
        }
        match parse("c DELETE INBOX").1 {
            Command::Delete { mailbox } => assert_eq!(mailbox, "INBOX"),
            c => panic!("wrong command {:?}", c),
        }
        match parse("r RENAME Old New").1 {
            Command::Rename { from, to } => {
                assert_eq!(from, "Old");
                assert_eq!(to, "New");
            }
            c => panic!("wrong command {:?}", c),
        }
    }

    #[test]
    fn list_with_wildcards_and_empty_reference() {
        match parse("l LIST \"\" *").1 {
            Command::List { reference, pattern } => {
                assert_eq!(reference, "");
                assert_eq!(pattern, "*");
            }
            c => panic!("wrong command {:?}", c),
        }
        match parse("l LIST \"\" University.%").1 {
            Command::List { pattern, .. } => assert_eq!(pattern, "University.%"),
            c => panic!("wrong command {:?}", c),
        }
    }

    #[test]
    fn append_literal_announcement() {
        match parse("b APPEND DoesNotExist {301}").1 {
            Command::Append {
                mailbox,
                flags,
                size,
            } => {
                assert_eq!(mailbox, "DoesNotExist");
                assert!(flags.is_empty());
                assert_eq!(size, 301);
            }
            c => panic!("wrong command {:?}", c),
        }
        match parse("c APPEND inbox (\\Seen \\Draft) {42}").1 {
            Command::Append { flags, size, .. } => {
                assert_eq!(flags, vec![Flag::Seen, Flag::Draft]);
                assert_eq!(size, 42);
            }
            c => panic!("wrong command {:?}", c),
        }
    }

    #[test]
    fn store_with_operators_and_silent() {
        match parse("s STORE 2,4:* +FLAGS (\\Seen \\Answered)").1 {
            Command::Store {
                seqset,
                operator,
                silent,
                flags,
            } => {
                assert_eq!(
                    seqset,
                    SeqSet(vec![
                        SeqRange {
                            from: Seq::Num(2),
                            to: None
                        },
                        SeqRange {
                            from: Seq::Num(4),
                            to: Some(Seq::Last)
                        },
                    ])
                );
                assert_eq!(operator, StoreOperator::Add);
                assert!(!silent);
                assert_eq!(flags, vec![Flag::Seen, Flag::Answered]);
            }
            c => panic!("wrong command {:?}", c),
        }
        match parse("s STORE 1:* -FLAGS.SILENT (\\Deleted)").1 {
            Command::Store {
                operator, silent, ..
            } => {
                assert_eq!(operator, StoreOperator::Remove);
                assert!(silent);
            }
            c => panic!("wrong command {:?}", c),
        }
    }

    #[test]
    fn copy_command() {
        match parse("c COPY 1:3 Archive").1 {
            Command::Copy { seqset, mailbox } => {
                assert_eq!(mailbox, "Archive");
                assert_eq!(seqset.resolve(5).unwrap(), vec![1, 2, 3]);
            }
            c => panic!("wrong command {:?}", c),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_command("FROBNICATE now").is_err());
        assert!(parse_command("STORE 1:* SOMEFLAGS (\\Seen)").is_err());
        assert!(parse_command("STORE 1:* +FLAGS \\Seen").is_err());
        assert!(parse_command("APPEND NoSize").is_err());
        assert!(parse_command("").is_err());
    }
}
