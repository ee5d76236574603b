/* This file is part of AnoNet (https://anonet.dev)
 *
 * Copyright (C) 2023-2025 AnoNet developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{fs, io::Write, path::Path};

use crate::{Error, Result};

/// Load the entire contents of a file as a string.
pub fn load_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::Storage(format!("{path:?}: {e}")))
}

/// Save contents to a file, creating parent directories as needed.
pub fn save_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::Storage(format!("{parent:?}: {e}")))?;
    }

    let mut file =
        fs::File::create(path).map_err(|e| Error::Storage(format!("{path:?}: {e}")))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| Error::Storage(format!("{path:?}: {e}")))?;

    Ok(())
}
