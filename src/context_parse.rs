/* Parser for the class loader context descriptor grammar, e.g. */
/* "PCL[a.dex*123:b.dex*456];DLC[c.dex*789]{PCL[s.dex*111]}"    */

use crate::types::{
    ChainEntry, ClassLoaderContext, ClasspathEntry, LoaderInfo, LoaderKind,
    IN_MEMORY_DEX_LOCATION, SPECIAL_SHARED_LIBRARY,
};
use log::warn;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::opt;
use nom::error::{Error, ErrorKind};
use nom::Err::Failure;
use nom::IResult;

/// Parses a full descriptor. The whole input must be consumed; anything left
/// over (an unbalanced bracket, a stray separator) fails the parse.
pub(crate) fn parse_context(spec: &str, parse_checksums: bool) -> Option<ClassLoaderContext>
{
    if spec == SPECIAL_SHARED_LIBRARY
    {
        return Some(ClassLoaderContext::special());
    }
    if spec.is_empty()
    {
        // An empty descriptor is a single path loader with nothing on its classpath
        return Some(ClassLoaderContext::from_chain(vec![ChainEntry::Loader(
            LoaderInfo::new(LoaderKind::PathClassLoader),
        )]));
    }
    match parse_chain(spec, parse_checksums)
    {
        IResult::Ok(("", chain)) => Some(ClassLoaderContext::from_chain(
            chain.into_iter().map(ChainEntry::Loader).collect(),
        )),
        _ =>
        {
            warn!("Invalid class loader context: {}", spec);
            None
        }
    }
}

fn parse_chain(input: &str, parse_checksums: bool) -> IResult<&str, Vec<LoaderInfo>>
{
    let (mut input, first) = parse_loader_spec(input, parse_checksums)?;
    let mut chain = vec![first];
    loop
    {
        let (o, separator) = opt(char(';'))(input)?;
        if separator.is_none()
        {
            break;
        }
        let (o, next) = parse_loader_spec(o, parse_checksums)?;
        chain.push(next);
        input = o;
    }
    Ok((input, chain))
}

fn parse_loader_spec(input: &str, parse_checksums: bool) -> IResult<&str, LoaderInfo>
{
    let (input, kind) = parse_kind(input)?;
    let (input, _) = char('[')(input)?;
    let (input, classpath) = parse_classpath(input, kind, parse_checksums)?;
    let (input, _) = char(']')(input)?;
    let (input, shared_libraries) = parse_shared_libraries(input, parse_checksums)?;
    Ok((
        input,
        LoaderInfo {
            kind,
            classpath,
            opened_dex_files: vec![],
            shared_libraries,
        },
    ))
}

fn parse_kind(input: &str) -> IResult<&str, LoaderKind>
{
    let (input, token) = alt((tag("PCL"), tag("DLC"), tag("IMC")))(input)?;
    let kind = match token
    {
        "PCL" => LoaderKind::PathClassLoader,
        "DLC" => LoaderKind::DelegateLastClassLoader,
        _ => LoaderKind::InMemoryDexClassLoader,
    };
    Ok((input, kind))
}

fn parse_classpath(
    input: &str,
    kind: LoaderKind,
    parse_checksums: bool,
) -> IResult<&str, Vec<ClasspathEntry>>
{
    // "[]" is a valid empty classpath
    if input.starts_with(']')
    {
        return Ok((input, vec![]));
    }
    let (mut input, first) = parse_entry(input, kind, parse_checksums)?;
    let mut entries = vec![first];
    loop
    {
        let (o, separator) = opt(char(':'))(input)?;
        if separator.is_none()
        {
            break;
        }
        let (o, next) = parse_entry(o, kind, parse_checksums)?;
        entries.push(next);
        input = o;
    }
    Ok((input, entries))
}

fn parse_entry(
    input: &str,
    kind: LoaderKind,
    parse_checksums: bool,
) -> IResult<&str, ClasspathEntry>
{
    let (input, location) = take_while1(|c| c != ':' && c != '*' && c != ']')(input)?;
    let (input, star) = opt(char('*'))(input)?;
    let (input, checksum) = if star.is_some()
    {
        let (input, digits) = digit1(input)?;
        match digits.parse::<u32>()
        {
            Ok(checksum) => (input, Some(checksum)),
            Err(_) =>
            {
                return IResult::Err(Failure(Error { input, code: ErrorKind::Fail }));
            }
        }
    }
    else
    {
        (input, None)
    };

    if kind == LoaderKind::InMemoryDexClassLoader
    {
        // In-memory dex files have no path, the checksum is all that identifies them
        if location != IN_MEMORY_DEX_LOCATION || checksum.is_none()
        {
            return IResult::Err(Failure(Error { input, code: ErrorKind::Fail }));
        }
    }
    else if parse_checksums != checksum.is_some()
    {
        return IResult::Err(Failure(Error { input, code: ErrorKind::Fail }));
    }

    Ok((
        input,
        ClasspathEntry {
            location: location.to_string(),
            checksum,
        },
    ))
}

fn parse_shared_libraries(input: &str, parse_checksums: bool) -> IResult<&str, Vec<LoaderInfo>>
{
    let (input, open) = opt(char('{'))(input)?;
    if open.is_none()
    {
        return Ok((input, vec![]));
    }
    let (input, close) = opt(char('}'))(input)?;
    if close.is_some()
    {
        return Ok((input, vec![]));
    }
    let (mut input, first) = parse_library_entry(input, parse_checksums)?;
    let mut libraries = vec![first];
    loop
    {
        let (o, separator) = opt(char('#'))(input)?;
        if separator.is_none()
        {
            break;
        }
        let (o, next) = parse_library_entry(o, parse_checksums)?;
        libraries.push(next);
        input = o;
    }
    let (input, _) = char('}')(input)?;
    Ok((input, libraries))
}

// Each '#' alternative inside braces holds a full chain; only the head loader is
// attached as the shared library, the rest is accepted but carries no meaning.
fn parse_library_entry(input: &str, parse_checksums: bool) -> IResult<&str, LoaderInfo>
{
    let (input, mut chain) = parse_chain(input, parse_checksums)?;
    Ok((input, chain.remove(0)))
}
