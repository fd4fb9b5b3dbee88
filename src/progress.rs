/*
amflash, to unsparse images and resize partitions on Aml devices: progress module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::Result;

const TEMPLATE_CHUNKS: &str =
    "Unsparsing => [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}";

fn progress_style_with_template<S: AsRef<str>>(template: S)
    -> Result<ProgressStyle>
{
    let template = template.as_ref();
    match ProgressStyle::with_template(template) {
        Ok(style) => Ok(style),
        Err(e) => {
            log::error!(
                "Failed to create progress bar style from template '{}': {}",
                template, e
            );
            Err(e.into())
        }
    }
}

pub fn progress_bar_with_template<S>(length: u64, template: S)
    -> Result<ProgressBar>
where
    S: AsRef<str>,
{
    let style = progress_style_with_template(template)?;
    let bar = ProgressBar::new(length);
    bar.set_style(style);
    Ok(bar)
}

/// A ticking bar counting sparse chunks
pub fn progress_bar_for_chunks(total_chunks: u32) -> Result<ProgressBar> {
    let bar = progress_bar_with_template(total_chunks.into(), TEMPLATE_CHUNKS)?;
    bar.enable_steady_tick(Duration::from_secs(1));
    Ok(bar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_bar_counts_chunks() {
        let bar = progress_bar_for_chunks(3).unwrap();
        assert_eq!(bar.length(), Some(3));
        bar.finish_and_clear();
    }
}
